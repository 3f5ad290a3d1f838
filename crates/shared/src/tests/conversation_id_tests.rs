use super::*;

const CANONICAL: &str = "conv_+5214773790184_+5214793176502";

#[test]
fn canonicalizes_literal_plus_form() {
    let id = canonicalize(CANONICAL).expect("valid id");
    assert_eq!(id.to_string(), CANONICAL);
    assert_eq!(
        extract_participants(CANONICAL).expect("participants"),
        ("+5214773790184".to_string(), "+5214793176502".to_string())
    );
}

#[test]
fn mixed_encoding_maps_to_same_canonical_value() {
    let literal = canonicalize(CANONICAL).expect("literal");
    let mixed = canonicalize("conv_%2B5214773790184_+5214793176502").expect("mixed");
    let lowercase = canonicalize("conv_%2b5214773790184_%2B5214793176502").expect("lowercase");
    assert_eq!(literal, mixed);
    assert_eq!(literal, lowercase);
}

#[test]
fn missing_plus_is_added() {
    let id = canonicalize("conv_5214773790184_5214793176502").expect("bare digits");
    assert_eq!(id.to_string(), CANONICAL);
}

#[test]
fn transport_encoding_round_trips() {
    for raw in [
        CANONICAL,
        "conv_%2B5214773790184_%2B5214793176502",
        "conv_+1_+44",
        "conv_5214773790184_+5214793176502",
    ] {
        let id = canonicalize(raw).expect("valid");
        let encoded = encode_for_transport(&id);
        assert!(!encoded.contains('+'), "encoded form keeps a raw plus: {encoded}");
        assert_eq!(decode_from_transport(&encoded).expect("decode"), id);
    }
}

#[test]
fn encodes_plus_as_percent_2b() {
    let id = canonicalize(CANONICAL).expect("valid");
    assert_eq!(
        encode_for_transport(&id),
        "conv_%2B5214773790184_%2B5214793176502"
    );
}

#[test]
fn decode_repairs_plus_turned_into_space() {
    let id = decode_from_transport("conv_ 5214773790184_ 5214793176502").expect("repaired");
    assert_eq!(id.to_string(), CANONICAL);

    let encoded_space = decode_from_transport("conv_%205214773790184_+5214793176502")
        .expect("repaired encoded space");
    assert_eq!(encoded_space.to_string(), CANONICAL);
}

#[test]
fn canonicalize_does_not_repair_spaces() {
    let err = canonicalize("conv_ 5214773790184_ 5214793176502").expect_err("space");
    assert_eq!(err.reason, InvalidFormatReason::NonDigitPhone);
}

#[test]
fn rejects_malformed_ids() {
    let cases = [
        ("", InvalidFormatReason::Empty),
        ("   ", InvalidFormatReason::Empty),
        ("chat_+1_+2", InvalidFormatReason::MissingPrefix),
        ("conv_+1", InvalidFormatReason::WrongSegmentCount(1)),
        ("conv_+1_+2_+3", InvalidFormatReason::WrongSegmentCount(3)),
        ("conv_+_+2", InvalidFormatReason::EmptyPhone),
        ("conv_+12a_+2", InvalidFormatReason::NonDigitPhone),
        ("conv_++12_+2", InvalidFormatReason::NonDigitPhone),
        ("conv_%FF_+2", InvalidFormatReason::BadPercentEncoding),
    ];
    for (raw, reason) in cases {
        let err = canonicalize(raw).expect_err(raw);
        assert_eq!(err.reason, reason, "input {raw:?}");
        assert_eq!(err.raw, raw);
    }
}

#[test]
fn accepts_segments_of_any_digit_length() {
    let id = canonicalize("conv_%2B5214773790184123_+5214793176502").expect("long phone");
    assert_eq!(id.to_string(), "conv_+5214773790184123_+5214793176502");
    assert_eq!(id.participants(), ("+5214773790184123", "+5214793176502"));
    assert_eq!(decode_from_transport(&encode_for_transport(&id)).expect("decode"), id);
}

#[test]
fn serde_uses_canonical_string_and_rejects_invalid() {
    let id: ConversationId =
        serde_json::from_str("\"conv_%2B5214773790184_5214793176502\"").expect("deserialize");
    assert_eq!(serde_json::to_string(&id).expect("serialize"), format!("\"{CANONICAL}\""));
    assert!(serde_json::from_str::<ConversationId>("\"conv_nope\"").is_err());
}

#[test]
fn counterpart_skips_own_phone() {
    let id = canonicalize(CANONICAL).expect("valid");
    assert_eq!(id.counterpart(Some("+5214773790184")), "+5214793176502");
    assert_eq!(id.counterpart(Some("5214793176502")), "+5214773790184");
    assert_eq!(id.counterpart(None), "+5214773790184");
    assert!(id.involves("5214793176502"));
    assert!(!id.involves("+1"));
}
