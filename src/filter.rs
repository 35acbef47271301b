//! Search filter tree: BER encode/decode and string rendering (RFC 4511
//! §4.5.1 grammar, RFC 4515 rendering). Parsing filter *strings* belongs to
//! a separate grammar layer and is not provided here.

use crate::error::LdapError;
use crate::protocol::{BerReader, BerWriter};
use std::fmt::Write as _;

type Result<T> = std::result::Result<T, LdapError>;

// Filter choice tags.
const TAG_AND: u8 = 0xA0;
const TAG_OR: u8 = 0xA1;
const TAG_NOT: u8 = 0xA2;
const TAG_EQUALITY: u8 = 0xA3;
const TAG_SUBSTRINGS: u8 = 0xA4;
const TAG_GREATER_OR_EQUAL: u8 = 0xA5;
const TAG_LESS_OR_EQUAL: u8 = 0xA6;
/// Primitive: the value is the attribute description itself.
const TAG_PRESENT: u8 = 0x87;
const TAG_APPROX: u8 = 0xA8;
const TAG_EXTENSIBLE: u8 = 0xA9;

// Substring component tags.
const TAG_SUB_INITIAL: u8 = 0x80;
const TAG_SUB_ANY: u8 = 0x81;
const TAG_SUB_FINAL: u8 = 0x82;

// MatchingRuleAssertion component tags.
const TAG_MATCHING_RULE: u8 = 0x81;
const TAG_MATCHING_TYPE: u8 = 0x82;
const TAG_MATCH_VALUE: u8 = 0x83;
const TAG_DN_ATTRIBUTES: u8 = 0x84;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstringFilter {
    pub attribute: String,
    pub initial: Option<Vec<u8>>,
    pub any: Vec<Vec<u8>>,
    pub final_part: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingRuleAssertion {
    pub matching_rule: Option<String>,
    pub attribute: Option<String>,
    pub match_value: Vec<u8>,
    pub dn_attributes: bool,
}

/// A search filter expression. Attribute values are raw octets; callers that
/// need schema-aware normalization apply it before building the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality { attribute: String, value: Vec<u8> },
    Substrings(SubstringFilter),
    GreaterOrEqual { attribute: String, value: Vec<u8> },
    LessOrEqual { attribute: String, value: Vec<u8> },
    Present { attribute: String },
    Approximate { attribute: String, value: Vec<u8> },
    Extensible(MatchingRuleAssertion),
}

impl Filter {
    /// `(objectClass=*)` — the conventional match-everything filter.
    pub fn match_all() -> Self {
        Filter::Present {
            attribute: "objectClass".to_string(),
        }
    }

    pub fn equality(attribute: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Filter::Equality {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present {
            attribute: attribute.into(),
        }
    }

    pub fn encode(&self, w: &mut BerWriter) {
        match self {
            Filter::And(parts) => {
                let pos = w.begin(TAG_AND);
                for part in parts {
                    part.encode(w);
                }
                w.end(pos);
            }
            Filter::Or(parts) => {
                let pos = w.begin(TAG_OR);
                for part in parts {
                    part.encode(w);
                }
                w.end(pos);
            }
            Filter::Not(inner) => {
                let pos = w.begin(TAG_NOT);
                inner.encode(w);
                w.end(pos);
            }
            Filter::Equality { attribute, value } => {
                encode_ava(w, TAG_EQUALITY, attribute, value);
            }
            Filter::Substrings(sub) => {
                let pos = w.begin(TAG_SUBSTRINGS);
                w.write_string(&sub.attribute);
                let seq = w.begin(crate::protocol::BER_TAG_SEQUENCE);
                if let Some(initial) = &sub.initial {
                    w.write_tagged(TAG_SUB_INITIAL, initial);
                }
                for any in &sub.any {
                    w.write_tagged(TAG_SUB_ANY, any);
                }
                if let Some(final_part) = &sub.final_part {
                    w.write_tagged(TAG_SUB_FINAL, final_part);
                }
                w.end(seq);
                w.end(pos);
            }
            Filter::GreaterOrEqual { attribute, value } => {
                encode_ava(w, TAG_GREATER_OR_EQUAL, attribute, value);
            }
            Filter::LessOrEqual { attribute, value } => {
                encode_ava(w, TAG_LESS_OR_EQUAL, attribute, value);
            }
            Filter::Present { attribute } => {
                w.write_tagged(TAG_PRESENT, attribute.as_bytes());
            }
            Filter::Approximate { attribute, value } => {
                encode_ava(w, TAG_APPROX, attribute, value);
            }
            Filter::Extensible(assertion) => {
                let pos = w.begin(TAG_EXTENSIBLE);
                if let Some(rule) = &assertion.matching_rule {
                    w.write_tagged(TAG_MATCHING_RULE, rule.as_bytes());
                }
                if let Some(attribute) = &assertion.attribute {
                    w.write_tagged(TAG_MATCHING_TYPE, attribute.as_bytes());
                }
                w.write_tagged(TAG_MATCH_VALUE, &assertion.match_value);
                if assertion.dn_attributes {
                    w.write_tagged(TAG_DN_ATTRIBUTES, &[0xFF]);
                }
                w.end(pos);
            }
        }
    }

    pub fn decode(r: &mut BerReader<'_>) -> Result<Filter> {
        let (tag, value) = r.read_element()?;
        let mut inner = BerReader::new(value);
        match tag {
            TAG_AND => Ok(Filter::And(decode_set(&mut inner)?)),
            TAG_OR => Ok(Filter::Or(decode_set(&mut inner)?)),
            TAG_NOT => {
                let filter = Filter::decode(&mut inner)?;
                if !inner.is_empty() {
                    return Err(LdapError::decode("trailing data after NOT filter"));
                }
                Ok(Filter::Not(Box::new(filter)))
            }
            TAG_EQUALITY => decode_ava(&mut inner).map(|(attribute, value)| Filter::Equality {
                attribute,
                value,
            }),
            TAG_SUBSTRINGS => {
                let attribute = inner.read_string()?;
                let mut components = inner.read_sequence()?;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_part = None;
                while !components.is_empty() {
                    let (component_tag, bytes) = components.read_element()?;
                    match component_tag {
                        TAG_SUB_INITIAL => {
                            if initial.is_some() || !any.is_empty() || final_part.is_some() {
                                return Err(LdapError::decode(
                                    "substring initial component out of order",
                                ));
                            }
                            initial = Some(bytes.to_vec());
                        }
                        TAG_SUB_ANY => {
                            if final_part.is_some() {
                                return Err(LdapError::decode(
                                    "substring any component after final",
                                ));
                            }
                            any.push(bytes.to_vec());
                        }
                        TAG_SUB_FINAL => {
                            if final_part.is_some() {
                                return Err(LdapError::decode("duplicate substring final"));
                            }
                            final_part = Some(bytes.to_vec());
                        }
                        other => {
                            return Err(LdapError::decode(format!(
                                "unknown substring component tag 0x{other:02X}"
                            )))
                        }
                    }
                }
                if initial.is_none() && any.is_empty() && final_part.is_none() {
                    return Err(LdapError::decode("substring filter with no components"));
                }
                Ok(Filter::Substrings(SubstringFilter {
                    attribute,
                    initial,
                    any,
                    final_part,
                }))
            }
            TAG_GREATER_OR_EQUAL => {
                decode_ava(&mut inner).map(|(attribute, value)| Filter::GreaterOrEqual {
                    attribute,
                    value,
                })
            }
            TAG_LESS_OR_EQUAL => {
                decode_ava(&mut inner).map(|(attribute, value)| Filter::LessOrEqual {
                    attribute,
                    value,
                })
            }
            TAG_PRESENT => Ok(Filter::Present {
                attribute: BerReader::string_value(value, "present filter")?,
            }),
            TAG_APPROX => decode_ava(&mut inner).map(|(attribute, value)| Filter::Approximate {
                attribute,
                value,
            }),
            TAG_EXTENSIBLE => {
                let mut matching_rule = None;
                let mut attribute = None;
                let mut match_value = None;
                let mut dn_attributes = false;
                while !inner.is_empty() {
                    let (component_tag, bytes) = inner.read_element()?;
                    match component_tag {
                        TAG_MATCHING_RULE => {
                            matching_rule =
                                Some(BerReader::string_value(bytes, "matching rule")?);
                        }
                        TAG_MATCHING_TYPE => {
                            attribute = Some(BerReader::string_value(bytes, "matching type")?);
                        }
                        TAG_MATCH_VALUE => match_value = Some(bytes.to_vec()),
                        TAG_DN_ATTRIBUTES => {
                            if bytes.len() != 1 {
                                return Err(LdapError::decode("dnAttributes must be 1 byte"));
                            }
                            dn_attributes = bytes[0] != 0;
                        }
                        other => {
                            return Err(LdapError::decode(format!(
                                "unknown extensible match component tag 0x{other:02X}"
                            )))
                        }
                    }
                }
                let match_value = match_value
                    .ok_or_else(|| LdapError::decode("extensible match without matchValue"))?;
                if matching_rule.is_none() && attribute.is_none() {
                    return Err(LdapError::decode(
                        "extensible match needs a matching rule or an attribute",
                    ));
                }
                Ok(Filter::Extensible(MatchingRuleAssertion {
                    matching_rule,
                    attribute,
                    match_value,
                    dn_attributes,
                }))
            }
            other => Err(LdapError::decode(format!(
                "unknown filter tag 0x{other:02X}"
            ))),
        }
    }

    /// Render in RFC 4515 string form, with value escaping.
    pub fn to_filter_string(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) {
        match self {
            Filter::And(parts) => {
                out.push_str("(&");
                for part in parts {
                    part.render(out);
                }
                out.push(')');
            }
            Filter::Or(parts) => {
                out.push_str("(|");
                for part in parts {
                    part.render(out);
                }
                out.push(')');
            }
            Filter::Not(inner) => {
                out.push_str("(!");
                inner.render(out);
                out.push(')');
            }
            Filter::Equality { attribute, value } => render_ava(out, attribute, "=", value),
            Filter::Substrings(sub) => {
                out.push('(');
                out.push_str(&sub.attribute);
                out.push('=');
                if let Some(initial) = &sub.initial {
                    escape_value(out, initial);
                }
                out.push('*');
                for any in &sub.any {
                    escape_value(out, any);
                    out.push('*');
                }
                if let Some(final_part) = &sub.final_part {
                    escape_value(out, final_part);
                }
                out.push(')');
            }
            Filter::GreaterOrEqual { attribute, value } => render_ava(out, attribute, ">=", value),
            Filter::LessOrEqual { attribute, value } => render_ava(out, attribute, "<=", value),
            Filter::Present { attribute } => {
                out.push('(');
                out.push_str(attribute);
                out.push_str("=*)");
            }
            Filter::Approximate { attribute, value } => render_ava(out, attribute, "~=", value),
            Filter::Extensible(assertion) => {
                out.push('(');
                if let Some(attribute) = &assertion.attribute {
                    out.push_str(attribute);
                }
                if assertion.dn_attributes {
                    out.push_str(":dn");
                }
                if let Some(rule) = &assertion.matching_rule {
                    out.push(':');
                    out.push_str(rule);
                }
                out.push_str(":=");
                escape_value(out, &assertion.match_value);
                out.push(')');
            }
        }
    }
}

fn encode_ava(w: &mut BerWriter, tag: u8, attribute: &str, value: &[u8]) {
    let pos = w.begin(tag);
    w.write_string(attribute);
    w.write_octet_string(value);
    w.end(pos);
}

fn decode_ava(r: &mut BerReader<'_>) -> Result<(String, Vec<u8>)> {
    let attribute = r.read_string()?;
    let value = r.read_octet_string()?.to_vec();
    if !r.is_empty() {
        return Err(LdapError::decode("trailing data after assertion value"));
    }
    Ok((attribute, value))
}

fn decode_set(r: &mut BerReader<'_>) -> Result<Vec<Filter>> {
    let mut parts = Vec::new();
    while !r.is_empty() {
        parts.push(Filter::decode(r)?);
    }
    if parts.is_empty() {
        return Err(LdapError::decode("empty filter set"));
    }
    Ok(parts)
}

fn render_ava(out: &mut String, attribute: &str, op: &str, value: &[u8]) {
    out.push('(');
    out.push_str(attribute);
    out.push_str(op);
    escape_value(out, value);
    out.push(')');
}

/// RFC 4515 §3 escaping: NUL, parens, asterisk, backslash, and any
/// non-printable byte render as \XX.
fn escape_value(out: &mut String, value: &[u8]) {
    for &b in value {
        match b {
            b'\0' | b'(' | b')' | b'*' | b'\\' => {
                let _ = write!(out, "\\{b:02x}");
            }
            0x20..=0x7E => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{b:02x}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(filter: &Filter) -> Filter {
        let mut w = BerWriter::new();
        filter.encode(&mut w);
        let buf = w.into_vec();
        let mut r = BerReader::new(&buf);
        let decoded = Filter::decode(&mut r).unwrap();
        assert!(r.is_empty(), "trailing bytes after {filter:?}");
        decoded
    }

    #[test]
    fn equality_round_trip() {
        let f = Filter::equality("cn", "smith".as_bytes());
        assert_eq!(round_trip(&f), f);
    }

    #[test]
    fn present_round_trip() {
        let f = Filter::match_all();
        assert_eq!(round_trip(&f), f);
        // Present is primitive: tag 0x87, value is the attribute itself.
        let mut w = BerWriter::new();
        f.encode(&mut w);
        let buf = w.into_vec();
        assert_eq!(buf[0], 0x87);
        assert_eq!(&buf[2..], b"objectClass");
    }

    #[test]
    fn composite_round_trip() {
        let f = Filter::And(vec![
            Filter::equality("objectClass", "person".as_bytes()),
            Filter::Or(vec![
                Filter::present("mail"),
                Filter::Not(Box::new(Filter::equality("st", "disabled".as_bytes()))),
            ]),
            Filter::GreaterOrEqual {
                attribute: "uidNumber".to_string(),
                value: b"1000".to_vec(),
            },
            Filter::LessOrEqual {
                attribute: "uidNumber".to_string(),
                value: b"9999".to_vec(),
            },
            Filter::Approximate {
                attribute: "givenName".to_string(),
                value: b"jon".to_vec(),
            },
        ]);
        assert_eq!(round_trip(&f), f);
    }

    #[test]
    fn substrings_round_trip() {
        let f = Filter::Substrings(SubstringFilter {
            attribute: "cn".to_string(),
            initial: Some(b"Jo".to_vec()),
            any: vec![b"nat".to_vec(), b"han".to_vec()],
            final_part: Some(b"son".to_vec()),
        });
        assert_eq!(round_trip(&f), f);
    }

    #[test]
    fn extensible_round_trip() {
        let f = Filter::Extensible(MatchingRuleAssertion {
            matching_rule: Some("caseExactMatch".to_string()),
            attribute: Some("cn".to_string()),
            match_value: b"Fred".to_vec(),
            dn_attributes: true,
        });
        assert_eq!(round_trip(&f), f);
    }

    #[test]
    fn substrings_component_order_enforced() {
        // final (0x82) before any (0x81) must not decode.
        let mut w = BerWriter::new();
        let pos = w.begin(0xA4);
        w.write_string("cn");
        let seq = w.begin(0x30);
        w.write_tagged(0x82, b"end");
        w.write_tagged(0x81, b"mid");
        w.end(seq);
        w.end(pos);
        let buf = w.into_vec();
        let mut r = BerReader::new(&buf);
        assert!(Filter::decode(&mut r).is_err());
    }

    #[test]
    fn unknown_filter_tag_rejected() {
        let data = [0xAB, 0x02, 0x04, 0x00];
        let mut r = BerReader::new(&data);
        assert!(Filter::decode(&mut r).is_err());
    }

    #[test]
    fn string_rendering() {
        assert_eq!(Filter::match_all().to_filter_string(), "(objectClass=*)");
        assert_eq!(
            Filter::equality("cn", "a*b".as_bytes()).to_filter_string(),
            "(cn=a\\2ab)"
        );
        let f = Filter::And(vec![
            Filter::equality("objectClass", "person".as_bytes()),
            Filter::Not(Box::new(Filter::present("mail"))),
        ]);
        assert_eq!(
            f.to_filter_string(),
            "(&(objectClass=person)(!(mail=*)))"
        );
        let sub = Filter::Substrings(SubstringFilter {
            attribute: "cn".to_string(),
            initial: Some(b"Jo".to_vec()),
            any: vec![b"na".to_vec()],
            final_part: None,
        });
        assert_eq!(sub.to_filter_string(), "(cn=Jo*na*)");
    }
}
