// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! This module propagates trace context through RabbitMQ message headers.
//! The publisher injects the current context into the outgoing headers and
//! the consumer runtime extracts it to open one consumer span per delivery.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Carrier adapter between OpenTelemetry propagators and the AMQP header
/// table of a message.
///
/// Injection writes every propagator field as a lowercase `LongString`
/// header; extraction only reads `LongString` headers and ignores the
/// other AMQP value types.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderPropagator<'a> {
    /// Wraps a header table.
    ///
    /// # Parameters
    /// * `headers` - The AMQP headers to write to or read from
    ///
    /// # Returns
    /// A propagator carrier borrowing `headers`
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    /// Stores one propagator field in the headers of an outgoing message.
    ///
    /// # Parameters
    /// * `key` - Field name, stored lowercased
    /// * `value` - Field value, stored as a `LongString`
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderPropagator<'_> {
    /// Reads one propagator field from the headers of a delivery.
    ///
    /// # Parameters
    /// * `key` - Field name
    ///
    /// # Returns
    /// The UTF-8 value of the header, or None when it is missing, not a
    /// `LongString` or not valid UTF-8
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    /// Lists every header key of the delivery.
    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Serializes a trace context into message headers.
///
/// # Parameters
/// * `ctx` - The context of the publishing span
///
/// # Returns
/// A fresh header table holding only the fields written by the global
/// text map propagator (empty when no propagator is installed)
pub(crate) fn inject_context(ctx: &Context) -> BTreeMap<ShortString, AMQPValue> {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(&mut headers))
    });

    headers
}

/// Creates a consumer span for a delivery, parented on the context carried
/// in its headers.
///
/// # Parameters
/// * `props` - Properties of the delivery, whose headers carry the context
/// * `tracer` - Tracer used to start the span
/// * `name` - Span name, the message type being consumed
///
/// # Returns
/// The extracted parent context and the started `SpanKind::Consumer` span
pub fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(
            &mut props.headers().clone().unwrap_or_default().inner().clone(),
        ))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
