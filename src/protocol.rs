//! LDAP v3 protocol model and BER primitives (RFC 4511).
//!
//! Typed request/response structures plus the tag/length/value reader and
//! writer the codec is built on. Pure data; no connection state.

use crate::error::LdapError;
use crate::filter::Filter;
use std::fmt;

type Result<T> = std::result::Result<T, LdapError>;

// Protocol operation tags ([APPLICATION n], constructed unless noted).
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
/// [APPLICATION 8] primitive: the value is the DN itself.
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
/// [APPLICATION 16] primitive: the value is the abandoned message id.
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

// Context-specific tags inside the envelope and operation bodies.
/// Controls attached to an LDAPMessage: [0] SEQUENCE OF Control.
pub const LDAP_TAG_CONTROLS: u8 = 0xA0;
/// Referral inside an LDAPResult: [3] SEQUENCE OF URI.
pub const LDAP_TAG_REFERRAL: u8 = 0xA3;
/// Simple bind credentials: [0] OCTET STRING.
pub const LDAP_TAG_AUTH_SIMPLE: u8 = 0x80;
/// SASL bind credentials: [3] SaslCredentials.
pub const LDAP_TAG_AUTH_SASL: u8 = 0xA3;
/// Server SASL credentials in a BindResponse: [7] OCTET STRING.
pub const LDAP_TAG_SERVER_SASL_CREDS: u8 = 0x87;
/// ModifyDN newSuperior: [0] LDAPDN.
pub const LDAP_TAG_NEW_SUPERIOR: u8 = 0x80;
/// ExtendedRequest requestName [0] / requestValue [1].
pub const LDAP_TAG_EXTENDED_REQUEST_NAME: u8 = 0x80;
pub const LDAP_TAG_EXTENDED_REQUEST_VALUE: u8 = 0x81;
/// ExtendedResponse responseName [10] / responseValue [11].
pub const LDAP_TAG_EXTENDED_RESPONSE_NAME: u8 = 0x8A;
pub const LDAP_TAG_EXTENDED_RESPONSE_VALUE: u8 = 0x8B;
/// IntermediateResponse responseName [0] / responseValue [1].
pub const LDAP_TAG_INTERMEDIATE_NAME: u8 = 0x80;
pub const LDAP_TAG_INTERMEDIATE_VALUE: u8 = 0x81;

// Universal tags.
pub const BER_TAG_BOOLEAN: u8 = 0x01;
pub const BER_TAG_INTEGER: u8 = 0x02;
pub const BER_TAG_OCTET_STRING: u8 = 0x04;
pub const BER_TAG_ENUMERATED: u8 = 0x0A;
pub const BER_TAG_SEQUENCE: u8 = 0x30;
pub const BER_TAG_SET: u8 = 0x31;

/// StartTLS extended operation (RFC 4511 §4.14).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// Notice of disconnection unsolicited notification (RFC 4511 §4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";
/// WhoAmI extended operation (RFC 4532).
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// RFC 4511 §4.1.9 result codes. `Uncatalogued` keeps unknown values intact
/// so private-range codes survive a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    StrongerAuthRequired,
    Referral,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    ConfidentialityRequired,
    SaslBindInProgress,
    NoSuchAttribute,
    UndefinedAttributeType,
    InappropriateMatching,
    ConstraintViolation,
    AttributeOrValueExists,
    InvalidAttributeSyntax,
    NoSuchObject,
    AliasProblem,
    InvalidDnSyntax,
    AliasDereferencingProblem,
    InappropriateAuthentication,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    LoopDetect,
    NamingViolation,
    ObjectClassViolation,
    NotAllowedOnNonLeaf,
    NotAllowedOnRdn,
    EntryAlreadyExists,
    ObjectClassModsProhibited,
    AffectsMultipleDsas,
    Other,
    Uncatalogued(i32),
}

impl ResultCode {
    pub fn from_code(code: i32) -> Self {
        use ResultCode::*;
        match code {
            0 => Success,
            1 => OperationsError,
            2 => ProtocolError,
            3 => TimeLimitExceeded,
            4 => SizeLimitExceeded,
            5 => CompareFalse,
            6 => CompareTrue,
            7 => AuthMethodNotSupported,
            8 => StrongerAuthRequired,
            10 => Referral,
            11 => AdminLimitExceeded,
            12 => UnavailableCriticalExtension,
            13 => ConfidentialityRequired,
            14 => SaslBindInProgress,
            16 => NoSuchAttribute,
            17 => UndefinedAttributeType,
            18 => InappropriateMatching,
            19 => ConstraintViolation,
            20 => AttributeOrValueExists,
            21 => InvalidAttributeSyntax,
            32 => NoSuchObject,
            33 => AliasProblem,
            34 => InvalidDnSyntax,
            36 => AliasDereferencingProblem,
            48 => InappropriateAuthentication,
            49 => InvalidCredentials,
            50 => InsufficientAccessRights,
            51 => Busy,
            52 => Unavailable,
            53 => UnwillingToPerform,
            54 => LoopDetect,
            64 => NamingViolation,
            65 => ObjectClassViolation,
            66 => NotAllowedOnNonLeaf,
            67 => NotAllowedOnRdn,
            68 => EntryAlreadyExists,
            69 => ObjectClassModsProhibited,
            71 => AffectsMultipleDsas,
            80 => Other,
            other => Uncatalogued(other),
        }
    }

    pub fn code(self) -> i32 {
        use ResultCode::*;
        match self {
            Success => 0,
            OperationsError => 1,
            ProtocolError => 2,
            TimeLimitExceeded => 3,
            SizeLimitExceeded => 4,
            CompareFalse => 5,
            CompareTrue => 6,
            AuthMethodNotSupported => 7,
            StrongerAuthRequired => 8,
            Referral => 10,
            AdminLimitExceeded => 11,
            UnavailableCriticalExtension => 12,
            ConfidentialityRequired => 13,
            SaslBindInProgress => 14,
            NoSuchAttribute => 16,
            UndefinedAttributeType => 17,
            InappropriateMatching => 18,
            ConstraintViolation => 19,
            AttributeOrValueExists => 20,
            InvalidAttributeSyntax => 21,
            NoSuchObject => 32,
            AliasProblem => 33,
            InvalidDnSyntax => 34,
            AliasDereferencingProblem => 36,
            InappropriateAuthentication => 48,
            InvalidCredentials => 49,
            InsufficientAccessRights => 50,
            Busy => 51,
            Unavailable => 52,
            UnwillingToPerform => 53,
            LoopDetect => 54,
            NamingViolation => 64,
            ObjectClassViolation => 65,
            NotAllowedOnNonLeaf => 66,
            NotAllowedOnRdn => 67,
            EntryAlreadyExists => 68,
            ObjectClassModsProhibited => 69,
            AffectsMultipleDsas => 71,
            Other => 80,
            Uncatalogued(c) => c,
        }
    }

    /// Codes that represent a completed-as-asked or still-in-progress
    /// outcome. Everything else surfaces as `LdapError::ResultError`.
    pub fn is_exceptional(self) -> bool {
        !matches!(
            self,
            ResultCode::Success
                | ResultCode::CompareFalse
                | ResultCode::CompareTrue
                | ResultCode::SaslBindInProgress
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Common trailer of every response: result code, matched DN, diagnostic
/// message, optional referral URIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn with_code(result_code: ResultCode) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: String::new(),
            referrals: Vec::new(),
        }
    }

    pub fn with_diagnostic(result_code: ResultCode, diagnostic: impl Into<String>) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic.into(),
            referrals: Vec::new(),
        }
    }

    /// Convert to the caller-facing outcome: exceptional codes become a
    /// result-carrying error, everything else passes through.
    pub fn into_outcome(self) -> std::result::Result<LdapResult, LdapError> {
        if self.result_code.is_exceptional() {
            Err(LdapError::ResultError(self))
        } else {
            Ok(self)
        }
    }
}

/// Request/response control: `{oid, criticality, value}` (RFC 4511 §4.1.11).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

/// Attribute description plus zero or more values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(attr_type: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self {
            attr_type: attr_type.into(),
            attr_values: values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i32> for SearchScope {
    type Error = LdapError;
    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(LdapError::decode(format!("invalid search scope: {value}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerefAliases {
    #[default]
    Never = 0,
    InSearching = 1,
    FindingBaseObject = 2,
    Always = 3,
}

impl TryFrom<i32> for DerefAliases {
    type Error = LdapError;
    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBaseObject),
            3 => Ok(DerefAliases::Always),
            _ => Err(LdapError::decode(format!("invalid derefAliases: {value}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultReference {
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

impl TryFrom<i32> for ModifyOperation {
    type Error = LdapError;
    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(ModifyOperation::Add),
            1 => Ok(ModifyOperation::Delete),
            2 => Ok(ModifyOperation::Replace),
            _ => Err(LdapError::decode(format!("invalid modify operation: {value}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

/// One protocol operation. `Unknown` preserves unrecognized tags so the
/// decoder never fails on a tag outside the known set, only on malformed
/// bodies of known tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(SearchResultReference),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
    Unknown { tag: u8, raw: Vec<u8> },
}

impl ProtocolOp {
    /// Short operation name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "bind",
            ProtocolOp::BindResponse(_) => "bind",
            ProtocolOp::UnbindRequest => "unbind",
            ProtocolOp::SearchRequest(_) => "search",
            ProtocolOp::SearchResultEntry(_) => "search entry",
            ProtocolOp::SearchResultReference(_) => "search reference",
            ProtocolOp::SearchResultDone(_) => "search done",
            ProtocolOp::ModifyRequest(_) | ProtocolOp::ModifyResponse(_) => "modify",
            ProtocolOp::AddRequest(_) | ProtocolOp::AddResponse(_) => "add",
            ProtocolOp::DelRequest(_) | ProtocolOp::DelResponse(_) => "delete",
            ProtocolOp::ModifyDnRequest(_) | ProtocolOp::ModifyDnResponse(_) => "modify dn",
            ProtocolOp::CompareRequest(_) | ProtocolOp::CompareResponse(_) => "compare",
            ProtocolOp::AbandonRequest(_) => "abandon",
            ProtocolOp::ExtendedRequest(_) | ProtocolOp::ExtendedResponse(_) => "extended",
            ProtocolOp::IntermediateResponse(_) => "intermediate",
            ProtocolOp::Unknown { .. } => "unknown",
        }
    }
}

/// Protocol message envelope:
/// `SEQUENCE { messageID INTEGER, protocolOp, controls [0] OPTIONAL }`.
/// An empty `controls` vector encodes as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn new(message_id: i32, op: ProtocolOp) -> Self {
        Self {
            message_id,
            op,
            controls: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// BER primitives
// ---------------------------------------------------------------------------

/// Bounded reader over one BER element region. Nested structures are parsed
/// by constructing a sub-reader over an element's value slice, so a malformed
/// inner length can never walk past its enclosing element.
pub struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Tag of the next element without consuming it. Used to gate optional
    /// trailing fields ("has next element AND tag matches").
    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(LdapError::decode(format!(
                "truncated {what}: need {n} bytes, {} remaining",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_length(&mut self) -> Result<usize> {
        let first = self.take(1, "length")?[0];
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let length_bytes = (first & 0x7F) as usize;
        if length_bytes == 0 {
            return Err(LdapError::decode("indefinite BER length not supported"));
        }
        if length_bytes > 4 {
            return Err(LdapError::decode(format!(
                "BER length field too wide: {length_bytes} bytes"
            )));
        }
        let bytes = self.take(length_bytes, "length")?;
        let mut length = 0usize;
        for &b in bytes {
            length = (length << 8) | b as usize;
        }
        Ok(length)
    }

    /// Read one element: returns its tag and value region.
    pub fn read_element(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.take(1, "tag")?[0];
        let length = self.read_length()?;
        let value = self.take(length, "element value")?;
        Ok((tag, value))
    }

    /// Read one element, failing unless it carries exactly `tag`.
    pub fn expect_element(&mut self, tag: u8, what: &str) -> Result<&'a [u8]> {
        match self.peek_tag() {
            Some(actual) if actual == tag => Ok(self.read_element()?.1),
            Some(actual) => Err(LdapError::decode(format!(
                "expected {what} (tag 0x{tag:02X}), got tag 0x{actual:02X}"
            ))),
            None => Err(LdapError::decode(format!("expected {what}, found end of element"))),
        }
    }

    /// Signed big-endian integer, range-checked into `i32`. Values wider
    /// than 32 bits after sign normalization are a decode error, not a
    /// silent truncation.
    fn int_from_bytes(bytes: &[u8], what: &str) -> Result<i32> {
        if bytes.is_empty() {
            return Err(LdapError::decode(format!("{what}: zero-length integer")));
        }
        let negative = bytes[0] & 0x80 != 0;
        // Leading sign-extension bytes are allowed; content must fit in 4.
        let mut significant = bytes;
        let pad: u8 = if negative { 0xFF } else { 0x00 };
        while significant.len() > 1 && significant[0] == pad {
            let next_sign = significant[1] & 0x80 != 0;
            if next_sign == negative {
                significant = &significant[1..];
            } else {
                break;
            }
        }
        if significant.len() > 4 {
            return Err(LdapError::decode(format!(
                "{what}: integer wider than 32 bits ({} bytes)",
                bytes.len()
            )));
        }
        let mut value: i32 = if negative { -1 } else { 0 };
        for &b in significant {
            value = (value << 8) | b as i32;
        }
        Ok(value)
    }

    pub fn read_integer(&mut self) -> Result<i32> {
        let bytes = self.expect_element(BER_TAG_INTEGER, "INTEGER")?;
        Self::int_from_bytes(bytes, "INTEGER")
    }

    pub fn read_enumerated(&mut self) -> Result<i32> {
        let bytes = self.expect_element(BER_TAG_ENUMERATED, "ENUMERATED")?;
        Self::int_from_bytes(bytes, "ENUMERATED")
    }

    pub fn read_boolean(&mut self) -> Result<bool> {
        let bytes = self.expect_element(BER_TAG_BOOLEAN, "BOOLEAN")?;
        if bytes.len() != 1 {
            return Err(LdapError::decode(format!(
                "BOOLEAN value must be 1 byte, got {}",
                bytes.len()
            )));
        }
        Ok(bytes[0] != 0)
    }

    pub fn read_octet_string(&mut self) -> Result<&'a [u8]> {
        self.expect_element(BER_TAG_OCTET_STRING, "OCTET STRING")
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| LdapError::decode("invalid UTF-8 in string value"))
    }

    /// Value region of a `SEQUENCE` element as a sub-reader.
    pub fn read_sequence(&mut self) -> Result<BerReader<'a>> {
        Ok(BerReader::new(self.expect_element(BER_TAG_SEQUENCE, "SEQUENCE")?))
    }

    /// Like `read_sequence` but for an arbitrary constructed tag.
    pub fn read_constructed(&mut self, tag: u8, what: &str) -> Result<BerReader<'a>> {
        Ok(BerReader::new(self.expect_element(tag, what)?))
    }

    /// Parse an integer from a primitive element's value region (used for
    /// tags like AbandonRequest where the application tag replaces INTEGER).
    pub fn int_value(bytes: &[u8], what: &str) -> Result<i32> {
        Self::int_from_bytes(bytes, what)
    }

    pub fn string_value(bytes: &[u8], what: &str) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| LdapError::decode(format!("{what}: invalid UTF-8")))
    }
}

/// BER element writer over a growable buffer. Constructed elements are
/// written with `begin`/`end`: a one-byte length placeholder is patched (and
/// widened in place when the content needs the long form) once the content
/// size is known. `end` calls must be nested innermost-first.
pub struct BerWriter {
    buf: Vec<u8>,
}

impl Default for BerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            self.buf.push(length as u8);
        } else {
            let mut bytes = [0u8; 8];
            let mut n = 0;
            let mut len = length;
            while len > 0 {
                bytes[n] = (len & 0xFF) as u8;
                len >>= 8;
                n += 1;
            }
            self.buf.push(0x80 | n as u8);
            for i in (0..n).rev() {
                self.buf.push(bytes[i]);
            }
        }
    }

    /// Open a constructed element; returns the placeholder position for `end`.
    pub fn begin(&mut self, tag: u8) -> usize {
        self.buf.push(tag);
        let pos = self.buf.len();
        self.buf.push(0);
        pos
    }

    /// Close a constructed element opened at `pos`.
    pub fn end(&mut self, pos: usize) {
        let content_len = self.buf.len() - (pos + 1);
        if content_len < 128 {
            self.buf[pos] = content_len as u8;
            return;
        }
        let mut bytes = Vec::with_capacity(4);
        let mut len = content_len;
        while len > 0 {
            bytes.push((len & 0xFF) as u8);
            len >>= 8;
        }
        bytes.reverse();
        self.buf[pos] = 0x80 | bytes.len() as u8;
        for (i, b) in bytes.iter().enumerate() {
            self.buf.insert(pos + 1 + i, *b);
        }
    }

    fn minimal_int_bytes(value: i32) -> ([u8; 5], usize) {
        let be = value.to_be_bytes();
        let negative = value < 0;
        let pad: u8 = if negative { 0xFF } else { 0x00 };
        let mut start = 0;
        while start < 3 && be[start] == pad && (be[start + 1] & 0x80 != 0) == negative {
            start += 1;
        }
        let mut out = [0u8; 5];
        let n = 4 - start;
        out[..n].copy_from_slice(&be[start..]);
        (out, n)
    }

    pub fn write_tagged_int(&mut self, tag: u8, value: i32) {
        let (bytes, n) = Self::minimal_int_bytes(value);
        self.buf.push(tag);
        self.write_length(n);
        self.buf.extend_from_slice(&bytes[..n]);
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tagged_int(BER_TAG_INTEGER, value);
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_tagged_int(BER_TAG_ENUMERATED, value);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.buf.push(BER_TAG_BOOLEAN);
        self.write_length(1);
        self.buf.push(if value { 0xFF } else { 0x00 });
    }

    /// Primitive element with an explicit tag (context-specific strings,
    /// the primitive DelRequest/AbandonRequest bodies, and so on).
    pub fn write_tagged(&mut self, tag: u8, value: &[u8]) {
        self.buf.push(tag);
        self.write_length(value.len());
        self.buf.extend_from_slice(value);
    }

    pub fn write_octet_string(&mut self, value: &[u8]) {
        self.write_tagged(BER_TAG_OCTET_STRING, value);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_octet_string(value.as_bytes());
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_code_round_trip() {
        for code in [0, 1, 2, 5, 6, 10, 14, 32, 49, 53, 80, 118, 4096] {
            assert_eq!(ResultCode::from_code(code).code(), code);
        }
    }

    #[test]
    fn result_code_exceptional_partition() {
        assert!(!ResultCode::Success.is_exceptional());
        assert!(!ResultCode::CompareFalse.is_exceptional());
        assert!(!ResultCode::CompareTrue.is_exceptional());
        assert!(!ResultCode::SaslBindInProgress.is_exceptional());
        assert!(ResultCode::OperationsError.is_exceptional());
        assert!(ResultCode::Referral.is_exceptional());
        assert!(ResultCode::InvalidCredentials.is_exceptional());
        assert!(ResultCode::Uncatalogued(118).is_exceptional());
    }

    #[test]
    fn writer_integer_forms() {
        let cases: [(i32, &[u8]); 7] = [
            (0, &[0x02, 0x01, 0x00]),
            (42, &[0x02, 0x01, 0x2A]),
            (127, &[0x02, 0x01, 0x7F]),
            (128, &[0x02, 0x02, 0x00, 0x80]),
            (-1, &[0x02, 0x01, 0xFF]),
            (-128, &[0x02, 0x01, 0x80]),
            (256, &[0x02, 0x02, 0x01, 0x00]),
        ];
        for (value, expected) in cases {
            let mut w = BerWriter::new();
            w.write_integer(value);
            assert_eq!(w.into_vec(), expected, "encoding of {value}");
        }
    }

    #[test]
    fn reader_integer_round_trip() {
        for value in [0, 1, -1, 127, 128, -128, -129, 65535, i32::MAX, i32::MIN] {
            let mut w = BerWriter::new();
            w.write_integer(value);
            let buf = w.into_vec();
            let mut r = BerReader::new(&buf);
            assert_eq!(r.read_integer().unwrap(), value);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn reader_rejects_wide_integer() {
        // 5 content bytes with no redundant sign padding: out of i32 range.
        let data = [0x02, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00];
        let mut r = BerReader::new(&data);
        assert!(r.read_integer().is_err());
    }

    #[test]
    fn reader_accepts_padded_integer() {
        // 0x00 0x7F is a redundant but legal encoding of 127.
        let data = [0x02, 0x02, 0x00, 0x7F];
        let mut r = BerReader::new(&data);
        assert_eq!(r.read_integer().unwrap(), 127);
    }

    #[test]
    fn long_form_length() {
        let mut w = BerWriter::new();
        let pos = w.begin(BER_TAG_SEQUENCE);
        for _ in 0..50 {
            w.write_string("abcdefgh");
        }
        w.end(pos);
        let buf = w.into_vec();
        assert_eq!(buf[0], 0x30);
        assert_eq!(buf[1], 0x82); // 2-byte long form
        let mut r = BerReader::new(&buf);
        let mut inner = r.read_sequence().unwrap();
        let mut count = 0;
        while !inner.is_empty() {
            assert_eq!(inner.read_string().unwrap(), "abcdefgh");
            count += 1;
        }
        assert_eq!(count, 50);
    }

    #[test]
    fn nested_long_form_patching_preserves_outer() {
        // Outer sequence long enough that the inner end() insertion must not
        // corrupt the outer placeholder bookkeeping.
        let mut w = BerWriter::new();
        let outer = w.begin(BER_TAG_SEQUENCE);
        w.write_integer(7);
        let inner = w.begin(BER_TAG_SEQUENCE);
        for _ in 0..40 {
            w.write_string("0123456789");
        }
        w.end(inner);
        w.write_integer(9);
        w.end(outer);
        let buf = w.into_vec();
        let mut r = BerReader::new(&buf);
        let mut seq = r.read_sequence().unwrap();
        assert_eq!(seq.read_integer().unwrap(), 7);
        let mut nested = seq.read_sequence().unwrap();
        let mut n = 0;
        while !nested.is_empty() {
            nested.read_string().unwrap();
            n += 1;
        }
        assert_eq!(n, 40);
        assert_eq!(seq.read_integer().unwrap(), 9);
        assert!(seq.is_empty());
        assert!(r.is_empty());
    }

    #[test]
    fn expect_element_tag_mismatch() {
        let data = [0x04, 0x01, 0x41];
        let mut r = BerReader::new(&data);
        let err = r.read_integer().unwrap_err();
        match err {
            LdapError::Decode(msg) => assert!(msg.contains("0x04"), "{msg}"),
            other => panic!("expected Decode, got {other:?}"),
        }
    }

    #[test]
    fn truncated_element_is_decode_error() {
        let data = [0x30, 0x10, 0x02, 0x01]; // claims 16 bytes, has 2
        let mut r = BerReader::new(&data);
        assert!(r.read_sequence().is_err());
    }

    #[test]
    fn peek_does_not_consume() {
        let data = [0x02, 0x01, 0x05];
        let mut r = BerReader::new(&data);
        assert_eq!(r.peek_tag(), Some(0x02));
        assert_eq!(r.read_integer().unwrap(), 5);
        assert_eq!(r.peek_tag(), None);
    }
}
