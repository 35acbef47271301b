//! Wire codec: typed messages to and from the BER element stream.
//!
//! Stateless. `encode_message` wraps an operation in the envelope SEQUENCE;
//! `parse_message` switches on the operation tag byte and falls back to an
//! opaque `ProtocolOp::Unknown` for tags outside the known set, so the codec
//! never fails on an unrecognized tag — only on malformed known bodies.

use crate::error::LdapError;
use crate::filter::Filter;
use crate::protocol::*;
use bytes::BytesMut;

type Result<T> = std::result::Result<T, LdapError>;

/// Encode a full envelope: `SEQUENCE { messageID, op, controls [0] OPT }`.
pub fn encode_message(msg: &LdapMessage) -> Vec<u8> {
    let mut w = BerWriter::new();
    let envelope = w.begin(BER_TAG_SEQUENCE);
    w.write_integer(msg.message_id);
    encode_op(&mut w, &msg.op);
    if !msg.controls.is_empty() {
        let controls = w.begin(LDAP_TAG_CONTROLS);
        for control in &msg.controls {
            let pos = w.begin(BER_TAG_SEQUENCE);
            w.write_string(&control.oid);
            if control.critical {
                w.write_boolean(true);
            }
            if let Some(value) = &control.value {
                w.write_octet_string(value);
            }
            w.end(pos);
        }
        w.end(controls);
    }
    w.end(envelope);
    w.into_vec()
}

fn encode_op(w: &mut BerWriter, op: &ProtocolOp) {
    match op {
        ProtocolOp::BindRequest(req) => {
            let pos = w.begin(LDAP_TAG_BIND_REQUEST);
            w.write_integer(req.version);
            w.write_string(&req.name);
            match &req.authentication {
                BindAuthentication::Simple(password) => {
                    w.write_tagged(LDAP_TAG_AUTH_SIMPLE, password.as_bytes());
                }
                BindAuthentication::Sasl {
                    mechanism,
                    credentials,
                } => {
                    let sasl = w.begin(LDAP_TAG_AUTH_SASL);
                    w.write_string(mechanism);
                    if let Some(creds) = credentials {
                        w.write_octet_string(creds);
                    }
                    w.end(sasl);
                }
            }
            w.end(pos);
        }
        ProtocolOp::BindResponse(resp) => {
            let pos = w.begin(LDAP_TAG_BIND_RESPONSE);
            encode_result(w, &resp.result);
            if let Some(creds) = &resp.server_sasl_creds {
                w.write_tagged(LDAP_TAG_SERVER_SASL_CREDS, creds);
            }
            w.end(pos);
        }
        ProtocolOp::UnbindRequest => {
            // [APPLICATION 2] NULL: empty value.
            w.write_tagged(LDAP_TAG_UNBIND_REQUEST, &[]);
        }
        ProtocolOp::SearchRequest(req) => {
            let pos = w.begin(LDAP_TAG_SEARCH_REQUEST);
            w.write_string(&req.base_object);
            w.write_enumerated(req.scope as i32);
            w.write_enumerated(req.deref_aliases as i32);
            w.write_integer(req.size_limit);
            w.write_integer(req.time_limit);
            w.write_boolean(req.types_only);
            req.filter.encode(w);
            let attrs = w.begin(BER_TAG_SEQUENCE);
            for attr in &req.attributes {
                w.write_string(attr);
            }
            w.end(attrs);
            w.end(pos);
        }
        ProtocolOp::SearchResultEntry(entry) => {
            let pos = w.begin(LDAP_TAG_SEARCH_RESULT_ENTRY);
            w.write_string(&entry.object_name);
            let attrs = w.begin(BER_TAG_SEQUENCE);
            for attr in &entry.attributes {
                encode_attribute(w, attr);
            }
            w.end(attrs);
            w.end(pos);
        }
        ProtocolOp::SearchResultReference(reference) => {
            let pos = w.begin(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            for uri in &reference.uris {
                w.write_string(uri);
            }
            w.end(pos);
        }
        ProtocolOp::SearchResultDone(result) => {
            encode_result_op(w, LDAP_TAG_SEARCH_RESULT_DONE, result);
        }
        ProtocolOp::ModifyRequest(req) => {
            let pos = w.begin(LDAP_TAG_MODIFY_REQUEST);
            w.write_string(&req.object);
            let changes = w.begin(BER_TAG_SEQUENCE);
            for change in &req.changes {
                let change_pos = w.begin(BER_TAG_SEQUENCE);
                w.write_enumerated(change.operation as i32);
                encode_attribute(w, &change.modification);
                w.end(change_pos);
            }
            w.end(changes);
            w.end(pos);
        }
        ProtocolOp::ModifyResponse(result) => {
            encode_result_op(w, LDAP_TAG_MODIFY_RESPONSE, result);
        }
        ProtocolOp::AddRequest(req) => {
            let pos = w.begin(LDAP_TAG_ADD_REQUEST);
            w.write_string(&req.entry);
            let attrs = w.begin(BER_TAG_SEQUENCE);
            for attr in &req.attributes {
                encode_attribute(w, attr);
            }
            w.end(attrs);
            w.end(pos);
        }
        ProtocolOp::AddResponse(result) => {
            encode_result_op(w, LDAP_TAG_ADD_RESPONSE, result);
        }
        ProtocolOp::DelRequest(req) => {
            // Primitive: the DN is the value region.
            w.write_tagged(LDAP_TAG_DEL_REQUEST, req.entry.as_bytes());
        }
        ProtocolOp::DelResponse(result) => {
            encode_result_op(w, LDAP_TAG_DEL_RESPONSE, result);
        }
        ProtocolOp::ModifyDnRequest(req) => {
            let pos = w.begin(LDAP_TAG_MODIFY_DN_REQUEST);
            w.write_string(&req.entry);
            w.write_string(&req.new_rdn);
            w.write_boolean(req.delete_old_rdn);
            if let Some(superior) = &req.new_superior {
                w.write_tagged(LDAP_TAG_NEW_SUPERIOR, superior.as_bytes());
            }
            w.end(pos);
        }
        ProtocolOp::ModifyDnResponse(result) => {
            encode_result_op(w, LDAP_TAG_MODIFY_DN_RESPONSE, result);
        }
        ProtocolOp::CompareRequest(req) => {
            let pos = w.begin(LDAP_TAG_COMPARE_REQUEST);
            w.write_string(&req.entry);
            let ava = w.begin(BER_TAG_SEQUENCE);
            w.write_string(&req.attr);
            w.write_octet_string(&req.assertion_value);
            w.end(ava);
            w.end(pos);
        }
        ProtocolOp::CompareResponse(result) => {
            encode_result_op(w, LDAP_TAG_COMPARE_RESPONSE, result);
        }
        ProtocolOp::AbandonRequest(id) => {
            // Primitive: the message id is the value region.
            w.write_tagged_int(LDAP_TAG_ABANDON_REQUEST, *id);
        }
        ProtocolOp::ExtendedRequest(req) => {
            let pos = w.begin(LDAP_TAG_EXTENDED_REQUEST);
            w.write_tagged(LDAP_TAG_EXTENDED_REQUEST_NAME, req.request_name.as_bytes());
            if let Some(value) = &req.request_value {
                w.write_tagged(LDAP_TAG_EXTENDED_REQUEST_VALUE, value);
            }
            w.end(pos);
        }
        ProtocolOp::ExtendedResponse(resp) => {
            let pos = w.begin(LDAP_TAG_EXTENDED_RESPONSE);
            encode_result(w, &resp.result);
            if let Some(name) = &resp.response_name {
                w.write_tagged(LDAP_TAG_EXTENDED_RESPONSE_NAME, name.as_bytes());
            }
            if let Some(value) = &resp.response_value {
                w.write_tagged(LDAP_TAG_EXTENDED_RESPONSE_VALUE, value);
            }
            w.end(pos);
        }
        ProtocolOp::IntermediateResponse(resp) => {
            let pos = w.begin(LDAP_TAG_INTERMEDIATE_RESPONSE);
            if let Some(name) = &resp.response_name {
                w.write_tagged(LDAP_TAG_INTERMEDIATE_NAME, name.as_bytes());
            }
            if let Some(value) = &resp.response_value {
                w.write_tagged(LDAP_TAG_INTERMEDIATE_VALUE, value);
            }
            w.end(pos);
        }
        ProtocolOp::Unknown { tag, raw } => {
            w.write_tagged(*tag, raw);
        }
    }
}

fn encode_result(w: &mut BerWriter, result: &LdapResult) {
    w.write_enumerated(result.result_code.code());
    w.write_string(&result.matched_dn);
    w.write_string(&result.diagnostic_message);
    if !result.referrals.is_empty() {
        let pos = w.begin(LDAP_TAG_REFERRAL);
        for uri in &result.referrals {
            w.write_string(uri);
        }
        w.end(pos);
    }
}

fn encode_result_op(w: &mut BerWriter, tag: u8, result: &LdapResult) {
    let pos = w.begin(tag);
    encode_result(w, result);
    w.end(pos);
}

fn encode_attribute(w: &mut BerWriter, attr: &Attribute) {
    let pos = w.begin(BER_TAG_SEQUENCE);
    w.write_string(&attr.attr_type);
    let vals = w.begin(BER_TAG_SET);
    for value in &attr.attr_values {
        w.write_octet_string(value);
    }
    w.end(vals);
    w.end(pos);
}

/// Parse one complete envelope from `data`, which must hold exactly one
/// message (use `try_read_frame` to cut frames out of a byte stream).
pub fn parse_message(data: &[u8]) -> Result<LdapMessage> {
    let mut r = BerReader::new(data);
    let mut envelope = r.read_sequence()?;
    let message_id = envelope.read_integer()?;
    let (tag, body) = envelope.read_element()?;
    let op = parse_op(tag, body)?;
    let controls = if envelope.peek_tag() == Some(LDAP_TAG_CONTROLS) {
        parse_controls(&mut envelope)?
    } else {
        Vec::new()
    };
    Ok(LdapMessage {
        message_id,
        op,
        controls,
    })
}

/// Header-only parse: `(message_id, operation_tag)`. Cheap pre-pass for
/// logging a frame that later fails a full parse.
pub fn parse_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut r = BerReader::new(data);
    let mut envelope = r.read_sequence()?;
    let message_id = envelope.read_integer()?;
    let tag = envelope
        .peek_tag()
        .ok_or_else(|| LdapError::decode("envelope without protocol op"))?;
    Ok((message_id, tag))
}

fn parse_op(tag: u8, body: &[u8]) -> Result<ProtocolOp> {
    let mut r = BerReader::new(body);
    let op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(&mut r)?),
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_bind_response(&mut r)?),
        LDAP_TAG_UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(&mut r)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => {
            ProtocolOp::SearchResultEntry(parse_search_result_entry(&mut r)?)
        }
        LDAP_TAG_SEARCH_RESULT_REFERENCE => {
            let mut uris = Vec::new();
            while !r.is_empty() {
                uris.push(r.read_string()?);
            }
            if uris.is_empty() {
                return Err(LdapError::decode("search result reference without URIs"));
            }
            ProtocolOp::SearchResultReference(SearchResultReference { uris })
        }
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(parse_result(&mut r)?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(parse_modify_request(&mut r)?),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(parse_result(&mut r)?),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(parse_add_request(&mut r)?),
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(parse_result(&mut r)?),
        LDAP_TAG_DEL_REQUEST => ProtocolOp::DelRequest(DelRequest {
            entry: BerReader::string_value(body, "delete request DN")?,
        }),
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(parse_result(&mut r)?),
        LDAP_TAG_MODIFY_DN_REQUEST => {
            ProtocolOp::ModifyDnRequest(parse_modify_dn_request(&mut r)?)
        }
        LDAP_TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDnResponse(parse_result(&mut r)?),
        LDAP_TAG_COMPARE_REQUEST => ProtocolOp::CompareRequest(parse_compare_request(&mut r)?),
        LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(parse_result(&mut r)?),
        LDAP_TAG_ABANDON_REQUEST => {
            ProtocolOp::AbandonRequest(BerReader::int_value(body, "abandon request")?)
        }
        LDAP_TAG_EXTENDED_REQUEST => ProtocolOp::ExtendedRequest(parse_extended_request(&mut r)?),
        LDAP_TAG_EXTENDED_RESPONSE => {
            ProtocolOp::ExtendedResponse(parse_extended_response(&mut r)?)
        }
        LDAP_TAG_INTERMEDIATE_RESPONSE => {
            ProtocolOp::IntermediateResponse(parse_intermediate_response(&mut r)?)
        }
        other => {
            return Ok(ProtocolOp::Unknown {
                tag: other,
                raw: body.to_vec(),
            })
        }
    };
    // Primitive ops consumed `body` directly; for the rest, trailing bytes
    // inside a known operation body are a decode error.
    match op {
        ProtocolOp::DelRequest(_) | ProtocolOp::AbandonRequest(_) | ProtocolOp::Unknown { .. } => {}
        _ => {
            if !r.is_empty() {
                return Err(LdapError::decode(format!(
                    "{} trailing bytes after operation with tag 0x{tag:02X}",
                    r.remaining()
                )));
            }
        }
    }
    Ok(op)
}

fn parse_controls(envelope: &mut BerReader<'_>) -> Result<Vec<Control>> {
    let mut outer = envelope.read_constructed(LDAP_TAG_CONTROLS, "controls")?;
    let mut controls = Vec::new();
    while !outer.is_empty() {
        let mut control = outer.read_sequence()?;
        let oid = control.read_string()?;
        let mut critical = false;
        if control.peek_tag() == Some(BER_TAG_BOOLEAN) {
            critical = control.read_boolean()?;
        }
        let value = if control.peek_tag() == Some(BER_TAG_OCTET_STRING) {
            Some(control.read_octet_string()?.to_vec())
        } else {
            None
        };
        if !control.is_empty() {
            return Err(LdapError::decode("trailing data inside control"));
        }
        controls.push(Control {
            oid,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn parse_result(r: &mut BerReader<'_>) -> Result<LdapResult> {
    let result_code = ResultCode::from_code(r.read_enumerated()?);
    let matched_dn = r.read_string()?;
    let diagnostic_message = r.read_string()?;
    let referrals = if r.peek_tag() == Some(LDAP_TAG_REFERRAL) {
        let mut referral = r.read_constructed(LDAP_TAG_REFERRAL, "referral")?;
        let mut uris = Vec::new();
        while !referral.is_empty() {
            uris.push(referral.read_string()?);
        }
        uris
    } else {
        Vec::new()
    };
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        referrals,
    })
}

fn parse_bind_request(r: &mut BerReader<'_>) -> Result<BindRequest> {
    let version = r.read_integer()?;
    let name = r.read_string()?;
    let (auth_tag, auth_body) = r.read_element()?;
    let authentication = match auth_tag {
        LDAP_TAG_AUTH_SIMPLE => BindAuthentication::Simple(BerReader::string_value(
            auth_body,
            "simple bind credentials",
        )?),
        LDAP_TAG_AUTH_SASL => {
            let mut sasl = BerReader::new(auth_body);
            let mechanism = sasl.read_string()?;
            let credentials = if sasl.peek_tag() == Some(BER_TAG_OCTET_STRING) {
                Some(sasl.read_octet_string()?.to_vec())
            } else {
                None
            };
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            }
        }
        other => {
            return Err(LdapError::decode(format!(
                "unknown bind authentication choice tag 0x{other:02X}"
            )))
        }
    };
    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_bind_response(r: &mut BerReader<'_>) -> Result<BindResponse> {
    let result = parse_result(r)?;
    let server_sasl_creds = if r.peek_tag() == Some(LDAP_TAG_SERVER_SASL_CREDS) {
        Some(r.expect_element(LDAP_TAG_SERVER_SASL_CREDS, "server SASL credentials")?.to_vec())
    } else {
        None
    };
    Ok(BindResponse {
        result,
        server_sasl_creds,
    })
}

fn parse_search_request(r: &mut BerReader<'_>) -> Result<SearchRequest> {
    let base_object = r.read_string()?;
    let scope = SearchScope::try_from(r.read_enumerated()?)?;
    let deref_aliases = DerefAliases::try_from(r.read_enumerated()?)?;
    let size_limit = r.read_integer()?;
    let time_limit = r.read_integer()?;
    let types_only = r.read_boolean()?;
    let filter = Filter::decode(r)?;
    let mut attrs = r.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(attrs.read_string()?);
    }
    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_attribute(r: &mut BerReader<'_>) -> Result<Attribute> {
    let mut attr = r.read_sequence()?;
    let attr_type = attr.read_string()?;
    let mut vals = attr.read_constructed(BER_TAG_SET, "attribute value SET")?;
    let mut attr_values = Vec::new();
    while !vals.is_empty() {
        attr_values.push(vals.read_octet_string()?.to_vec());
    }
    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

fn parse_search_result_entry(r: &mut BerReader<'_>) -> Result<SearchResultEntry> {
    let object_name = r.read_string()?;
    let mut attrs = r.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(parse_attribute(&mut attrs)?);
    }
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn parse_modify_request(r: &mut BerReader<'_>) -> Result<ModifyRequest> {
    let object = r.read_string()?;
    let mut changes_seq = r.read_sequence()?;
    let mut changes = Vec::new();
    while !changes_seq.is_empty() {
        let mut change = changes_seq.read_sequence()?;
        let operation = ModifyOperation::try_from(change.read_enumerated()?)?;
        let modification = parse_attribute(&mut change)?;
        changes.push(ModifyChange {
            operation,
            modification,
        });
    }
    Ok(ModifyRequest { object, changes })
}

fn parse_add_request(r: &mut BerReader<'_>) -> Result<AddRequest> {
    let entry = r.read_string()?;
    let mut attrs = r.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(parse_attribute(&mut attrs)?);
    }
    Ok(AddRequest { entry, attributes })
}

fn parse_modify_dn_request(r: &mut BerReader<'_>) -> Result<ModifyDnRequest> {
    let entry = r.read_string()?;
    let new_rdn = r.read_string()?;
    let delete_old_rdn = r.read_boolean()?;
    let new_superior = if r.peek_tag() == Some(LDAP_TAG_NEW_SUPERIOR) {
        Some(BerReader::string_value(
            r.expect_element(LDAP_TAG_NEW_SUPERIOR, "newSuperior")?,
            "newSuperior",
        )?)
    } else {
        None
    };
    Ok(ModifyDnRequest {
        entry,
        new_rdn,
        delete_old_rdn,
        new_superior,
    })
}

fn parse_compare_request(r: &mut BerReader<'_>) -> Result<CompareRequest> {
    let entry = r.read_string()?;
    let mut ava = r.read_sequence()?;
    let attr = ava.read_string()?;
    let assertion_value = ava.read_octet_string()?.to_vec();
    Ok(CompareRequest {
        entry,
        attr,
        assertion_value,
    })
}

fn parse_extended_request(r: &mut BerReader<'_>) -> Result<ExtendedRequest> {
    let request_name = BerReader::string_value(
        r.expect_element(LDAP_TAG_EXTENDED_REQUEST_NAME, "extended request name")?,
        "extended request name",
    )?;
    let request_value = if r.peek_tag() == Some(LDAP_TAG_EXTENDED_REQUEST_VALUE) {
        Some(
            r.expect_element(LDAP_TAG_EXTENDED_REQUEST_VALUE, "extended request value")?
                .to_vec(),
        )
    } else {
        None
    };
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn parse_extended_response(r: &mut BerReader<'_>) -> Result<ExtendedResponse> {
    let result = parse_result(r)?;
    let response_name = if r.peek_tag() == Some(LDAP_TAG_EXTENDED_RESPONSE_NAME) {
        Some(BerReader::string_value(
            r.expect_element(LDAP_TAG_EXTENDED_RESPONSE_NAME, "extended response name")?,
            "extended response name",
        )?)
    } else {
        None
    };
    let response_value = if r.peek_tag() == Some(LDAP_TAG_EXTENDED_RESPONSE_VALUE) {
        Some(
            r.expect_element(LDAP_TAG_EXTENDED_RESPONSE_VALUE, "extended response value")?
                .to_vec(),
        )
    } else {
        None
    };
    Ok(ExtendedResponse {
        result,
        response_name,
        response_value,
    })
}

fn parse_intermediate_response(r: &mut BerReader<'_>) -> Result<IntermediateResponse> {
    let response_name = if r.peek_tag() == Some(LDAP_TAG_INTERMEDIATE_NAME) {
        Some(BerReader::string_value(
            r.expect_element(LDAP_TAG_INTERMEDIATE_NAME, "intermediate response name")?,
            "intermediate response name",
        )?)
    } else {
        None
    };
    let response_value = if r.peek_tag() == Some(LDAP_TAG_INTERMEDIATE_VALUE) {
        Some(
            r.expect_element(LDAP_TAG_INTERMEDIATE_VALUE, "intermediate response value")?
                .to_vec(),
        )
    } else {
        None
    };
    Ok(IntermediateResponse {
        response_name,
        response_value,
    })
}

/// Cut one complete top-level frame (tag + length + value) out of `buffer`.
/// Returns `None` when more bytes are needed. The frame is removed from the
/// buffer on success. `max_frame` bounds the declared length so a bad peer
/// cannot make us buffer without limit.
pub fn try_read_frame(buffer: &mut BytesMut, max_frame: usize) -> Result<Option<Vec<u8>>> {
    if buffer.len() < 2 {
        return Ok(None);
    }
    if buffer[0] != BER_TAG_SEQUENCE {
        return Err(LdapError::decode(format!(
            "frame does not start with SEQUENCE: tag 0x{:02X}",
            buffer[0]
        )));
    }
    let first = buffer[1];
    let (header_len, content_len) = if first & 0x80 == 0 {
        (2usize, first as usize)
    } else {
        let length_bytes = (first & 0x7F) as usize;
        if length_bytes == 0 || length_bytes > 4 {
            return Err(LdapError::decode(format!(
                "invalid frame length encoding: 0x{first:02X}"
            )));
        }
        if buffer.len() < 2 + length_bytes {
            return Ok(None);
        }
        let mut len = 0usize;
        for i in 0..length_bytes {
            len = (len << 8) | buffer[2 + i] as usize;
        }
        (2 + length_bytes, len)
    };
    let total = header_len + content_len;
    if total > max_frame {
        return Err(LdapError::decode(format!(
            "frame of {total} bytes exceeds limit of {max_frame}"
        )));
    }
    if buffer.len() < total {
        return Ok(None);
    }
    Ok(Some(buffer.split_to(total).to_vec()))
}
