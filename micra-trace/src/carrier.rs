//! Context propagation over header carriers. The `http_headers`
//! format writes a `uber-trace-id` header
//! (`{trace}:{span}:{parent}:{flags}`) plus one `uberctx-` header per
//! baggage item.

use std::collections::BTreeMap;

use micra_core::message::Headers;

pub const HTTP_HEADERS: &str = "http_headers";

const TRACE_HEADER: &str = "uber-trace-id";
const BAGGAGE_PREFIX: &str = "uberctx-";

use crate::span::SpanContext;

/// Write a span context into a header carrier.
pub fn inject(context: &SpanContext, carrier: &mut Headers) {
    carrier.insert(
        TRACE_HEADER,
        format!("{:032x}:{:016x}:0:1", context.trace_id, context.span_id),
    );
    for (key, value) in &context.baggage {
        carrier.insert(format!("{}{}", BAGGAGE_PREFIX, key), value.clone());
    }
}

/// Read a span context back out of a header carrier.
pub fn extract(carrier: &Headers) -> Option<SpanContext> {
    let trace_header = carrier.get(TRACE_HEADER)?;
    let mut parts = trace_header.split(':');
    let trace_id = u128::from_str_radix(parts.next()?, 16).ok()?;
    let span_id = u64::from_str_radix(parts.next()?, 16).ok()?;

    let mut baggage = BTreeMap::new();
    for (name, value) in carrier.iter() {
        if let Some(key) = name.strip_prefix(BAGGAGE_PREFIX) {
            baggage.insert(key.to_string(), value.clone());
        }
    }

    Some(SpanContext {
        trace_id,
        span_id,
        baggage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_extract_roundtrip_preserves_trace_and_baggage() {
        let mut context = SpanContext::new_root();
        context.baggage.insert("k".into(), "v".into());
        context.baggage.insert("other".into(), "123".into());

        let mut carrier = Headers::new();
        inject(&context, &mut carrier);

        let extracted = extract(&carrier).unwrap();
        assert_eq!(extracted.trace_id, context.trace_id);
        assert_eq!(extracted.span_id, context.span_id);
        assert_eq!(extracted.baggage, context.baggage);
    }

    #[test]
    fn extract_absent_header_is_none() {
        let carrier = Headers::new();
        assert!(extract(&carrier).is_none());
    }

    #[test]
    fn extract_garbage_header_is_none() {
        let mut carrier = Headers::new();
        carrier.insert(TRACE_HEADER, "not-a-trace");
        assert!(extract(&carrier).is_none());
    }

    #[test]
    fn carrier_headers_are_case_insensitive() {
        let mut context = SpanContext::new_root();
        context.baggage.insert("k".into(), "v".into());
        let mut carrier = Headers::new();
        inject(&context, &mut carrier);
        assert!(carrier.get("Uber-Trace-Id").is_some());
        assert_eq!(carrier.get("UBERCTX-K"), Some("v"));
    }
}
