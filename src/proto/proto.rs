//! Shared data model plus the ATT/GATT, L2CAP-over-ATT, and advertisement
//! TLV dissectors. Dissectors never abort: malformed input degrades to a
//! partial result carrying a `"truncated"` warning, never a panic or `Err`.

use std::collections::HashMap;
use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;
use strum::Display;

use crate::pattern::PatternReport;

/// Most dissected PDUs carry a handful of fields (opcode, handle, value);
/// inline storage avoids a heap allocation for the common case, the same
/// trade-off `burble`'s `NumberOfCompletedPackets` makes for its own
/// small, per-event collections.
pub type ParsedFieldList = SmallVec<[ParsedField; 4]>;

/// 48-bit BLE device address, stored big-endian (`AA:BB:CC:DD:EE:FF` order).
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize)]
pub struct DeviceAddress(pub [u8; 6]);

impl DeviceAddress {
    #[must_use]
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Which radio interface delivered a [`RawPacket`].
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, serde::Serialize)]
pub enum PacketSource {
    HostRadio,
    SnifferRadio,
}

/// Coarse packet kind, set by the radio layer (never re-derived downstream).
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, serde::Serialize)]
pub enum PacketClass {
    Advertisement,
    Data,
    Connection,
    Disconnection,
    Unknown,
}

/// An immutable packet as delivered by a [`crate::radio::RadioInterface`].
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct RawPacket {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub source: PacketSource,
    pub address: DeviceAddress,
    /// Signed RSSI, dBm.
    pub rssi: i16,
    pub payload: Vec<u8>,
    pub packet_class: PacketClass,
    pub attributes: HashMap<String, String>,
}

/// How a [`ParsedField`]'s value should be rendered.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, serde::Serialize)]
pub enum Interpretation {
    Integer,
    Hex,
    Ascii,
    Enum,
    Uuid,
    Reserved,
}

/// A typed, decoded value attached to a [`ParsedField`].
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Bytes(b) => write!(f, "{}", to_hex(b)),
        }
    }
}

/// One decoded field within a dissected PDU.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ParsedField {
    pub name: String,
    pub value: FieldValue,
    pub raw_bytes: Vec<u8>,
    pub offset: usize,
    pub length: usize,
    pub interpretation: Interpretation,
}

impl ParsedField {
    fn new(
        name: impl Into<String>,
        value: FieldValue,
        raw_bytes: &[u8],
        offset: usize,
        interpretation: Interpretation,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            length: raw_bytes.len(),
            raw_bytes: raw_bytes.to_vec(),
            offset,
            interpretation,
        }
    }
}

/// Detected transport-layer protocol tag for a dissected packet.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, serde::Serialize)]
pub enum Protocol {
    #[strum(serialize = "ATT")]
    Att,
    #[strum(serialize = "L2CAP_ATT")]
    L2capAtt,
    #[strum(serialize = "ADV")]
    Adv,
    Unknown,
}

bitflags::bitflags! {
    /// Non-exclusive security heuristics raised by the inspector (spec.md
    /// §4.4). Tracked as a bitset internally, the same shape `burble`'s
    /// `AdvFlag` uses for its own advertising flags, and rendered to the
    /// spec's named-string form via [`SecurityFlags::names`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct SecurityFlags: u8 {
        const PAIRING_REQUEST = 1 << 0;
        const ENCRYPTED = 1 << 1;
        const SIGNED = 1 << 2;
    }
}

impl SecurityFlags {
    /// Spec-named strings for every flag set, in a stable, sorted order.
    #[must_use]
    pub fn names(self) -> Vec<String> {
        let mut out = Vec::new();
        if self.contains(Self::ENCRYPTED) {
            out.push("encrypted".to_owned());
        }
        if self.contains(Self::PAIRING_REQUEST) {
            out.push("pairing_request".to_owned());
        }
        if self.contains(Self::SIGNED) {
            out.push("signed".to_owned());
        }
        out
    }
}

/// Result of running one [`Dissector`] over a payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DissectionOutcome {
    pub parsed_fields: ParsedFieldList,
    pub parsed_map: HashMap<String, FieldValue>,
    pub warnings: Vec<String>,
}

impl DissectionOutcome {
    fn push(&mut self, field: ParsedField) {
        self.parsed_map.insert(field.name.clone(), field.value.clone());
        self.parsed_fields.push(field);
    }
}

/// Final per-packet analysis, produced by the packet inspector (C4).
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct InspectionResult {
    pub timestamp: u64,
    pub address: DeviceAddress,
    pub source: PacketSource,
    pub rssi: i16,
    pub data_length: usize,
    pub detected_protocol: Protocol,
    pub parsed_fields: ParsedFieldList,
    pub parsed_map: HashMap<String, FieldValue>,
    pub security_flags: Vec<String>,
    pub warnings: Vec<String>,
    pub hex_dump: String,
    pub pattern_summary: PatternReport,
}

/// ATT/GATT opcodes this core recognizes (spec.md §4.2's fixed table).
#[derive(Clone, Copy, Debug, Display, Eq, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum AttOpcode {
    #[strum(serialize = "Error Response")]
    ErrorResponse = 0x01,
    #[strum(serialize = "Exchange MTU Request")]
    ExchangeMtuRequest = 0x02,
    #[strum(serialize = "Exchange MTU Response")]
    ExchangeMtuResponse = 0x03,
    #[strum(serialize = "Find Information Request")]
    FindInformationRequest = 0x04,
    #[strum(serialize = "Find Information Response")]
    FindInformationResponse = 0x05,
    #[strum(serialize = "Read By Type Request")]
    ReadByTypeRequest = 0x08,
    #[strum(serialize = "Read By Type Response")]
    ReadByTypeResponse = 0x09,
    #[strum(serialize = "Read Request")]
    ReadRequest = 0x0A,
    #[strum(serialize = "Read Response")]
    ReadResponse = 0x0B,
    #[strum(serialize = "Write Request")]
    WriteRequest = 0x12,
    #[strum(serialize = "Write Response")]
    WriteResponse = 0x13,
    #[strum(serialize = "Write Command")]
    WriteCommand = 0x52,
    #[strum(serialize = "Handle Value Notification")]
    HandleValueNotification = 0x1B,
    #[strum(serialize = "Handle Value Indication")]
    HandleValueIndication = 0x1D,
}

/// Minimum PDU length for `opcode`, used both for protocol detection and
/// truncation warnings. `None` for opcodes this table doesn't recognize.
#[must_use]
pub fn min_att_len(opcode: AttOpcode) -> usize {
    use AttOpcode::{
        ErrorResponse, ExchangeMtuRequest, ExchangeMtuResponse, FindInformationRequest,
        FindInformationResponse, HandleValueIndication, HandleValueNotification, ReadByTypeRequest,
        ReadByTypeResponse, ReadRequest, ReadResponse, WriteCommand, WriteRequest, WriteResponse,
    };
    match opcode {
        ErrorResponse => 5,
        ExchangeMtuRequest | ExchangeMtuResponse => 3,
        FindInformationRequest => 5,
        FindInformationResponse => 2,
        ReadByTypeRequest => 7,
        ReadByTypeResponse => 2,
        ReadRequest | HandleValueNotification | HandleValueIndication | WriteCommand => 3,
        ReadResponse | WriteResponse => 1,
        WriteRequest => 3,
    }
}

/// ATT error codes (spec.md §4.2's fixed table).
fn att_error_name(code: u8) -> &'static str {
    match code {
        0x01 => "Invalid Handle",
        0x02 => "Read Not Permitted",
        0x03 => "Write Not Permitted",
        0x05 => "Insufficient Authentication",
        0x06 => "Request Not Supported",
        0x07 => "Invalid Offset",
        0x08 => "Insufficient Authorization",
        0x0A => "Attribute Not Found",
        0x0D => "Invalid Attribute Value Length",
        _ => "Unknown Error",
    }
}

fn le_u16(data: &[u8], offset: usize) -> Option<u16> {
    let slice = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([slice[0], slice[1]]))
}

fn safe_ascii(data: &[u8]) -> String {
    data.iter()
        .map(|&b| if (0x20..=0x7E).contains(&b) { b as char } else { '.' })
        .collect()
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

/// Attempts to recognize `data`'s first byte as an ATT opcode this core
/// knows about. Used by protocol detection rule 2.
#[must_use]
pub fn detect_att_opcode(data: &[u8]) -> Option<AttOpcode> {
    let &first = data.first()?;
    AttOpcode::try_from(first).ok()
}

/// Dissects an ATT/GATT PDU. Always returns `Some`; truncation yields a
/// partial [`DissectionOutcome`] with a `"truncated"` warning rather than
/// `None`.
#[must_use]
pub fn dissect_att(data: &[u8]) -> DissectionOutcome {
    let mut out = DissectionOutcome::default();
    let Some(opcode) = detect_att_opcode(data) else {
        out.warnings.push("unrecognized ATT opcode".to_owned());
        return out;
    };
    out.push(ParsedField::new(
        "opcode",
        FieldValue::Integer(i64::from(u8::from(opcode))),
        &data[0..1],
        0,
        Interpretation::Enum,
    ));
    out.parsed_map
        .insert("opcode_name".to_owned(), FieldValue::Text(opcode.to_string()));

    if data.len() < min_att_len(opcode) {
        out.warnings.push("truncated".to_owned());
    }

    match opcode {
        AttOpcode::ErrorResponse => dissect_error_response(data, &mut out),
        AttOpcode::ExchangeMtuRequest | AttOpcode::ExchangeMtuResponse => {
            dissect_mtu(data, &mut out);
        }
        AttOpcode::ReadRequest => dissect_handle_only(data, &mut out, "handle"),
        AttOpcode::ReadResponse => dissect_value(data, &mut out, 1),
        AttOpcode::WriteRequest | AttOpcode::WriteCommand => {
            dissect_handle_only(data, &mut out, "handle");
            dissect_value(data, &mut out, 3);
        }
        AttOpcode::WriteResponse => {}
        AttOpcode::HandleValueNotification | AttOpcode::HandleValueIndication => {
            dissect_handle_only(data, &mut out, "handle");
            dissect_value(data, &mut out, 3);
        }
        AttOpcode::FindInformationRequest => {
            dissect_handle_range(data, &mut out);
        }
        AttOpcode::FindInformationResponse | AttOpcode::ReadByTypeRequest | AttOpcode::ReadByTypeResponse => {
            dissect_value(data, &mut out, 1);
        }
    }

    out
}

fn dissect_error_response(data: &[u8], out: &mut DissectionOutcome) {
    if data.len() < 2 {
        return;
    }
    out.push(ParsedField::new(
        "request_opcode",
        FieldValue::Integer(i64::from(data[1])),
        &data[1..2],
        1,
        Interpretation::Hex,
    ));
    if let Some(handle) = le_u16(data, 2) {
        out.push(ParsedField::new(
            "handle",
            FieldValue::Text(format!("0x{handle:04X}")),
            &data[2..4],
            2,
            Interpretation::Hex,
        ));
    }
    if let Some(&code) = data.get(4) {
        out.push(ParsedField::new(
            "error_code",
            FieldValue::Integer(i64::from(code)),
            &data[4..5],
            4,
            Interpretation::Integer,
        ));
        out.parsed_map.insert(
            "error_name".to_owned(),
            FieldValue::Text(att_error_name(code).to_owned()),
        );
    }
}

fn dissect_mtu(data: &[u8], out: &mut DissectionOutcome) {
    if let Some(mtu) = le_u16(data, 1) {
        out.push(ParsedField::new(
            "mtu",
            FieldValue::Integer(i64::from(mtu)),
            &data[1..3],
            1,
            Interpretation::Integer,
        ));
    }
}

fn dissect_handle_only(data: &[u8], out: &mut DissectionOutcome, name: &str) {
    if let Some(handle) = le_u16(data, 1) {
        out.push(ParsedField::new(
            name,
            FieldValue::Text(format!("0x{handle:04X}")),
            &data[1..3],
            1,
            Interpretation::Hex,
        ));
    }
}

fn dissect_handle_range(data: &[u8], out: &mut DissectionOutcome) {
    if let Some(start) = le_u16(data, 1) {
        out.push(ParsedField::new(
            "start_handle",
            FieldValue::Text(format!("0x{start:04X}")),
            &data[1..3],
            1,
            Interpretation::Hex,
        ));
    }
    if let Some(end) = le_u16(data, 3) {
        out.push(ParsedField::new(
            "end_handle",
            FieldValue::Text(format!("0x{end:04X}")),
            &data[3..5],
            3,
            Interpretation::Hex,
        ));
    }
}

fn dissect_value(data: &[u8], out: &mut DissectionOutcome, from: usize) {
    if from > data.len() {
        return;
    }
    let value = &data[from..];
    out.push(ParsedField::new(
        "value",
        FieldValue::Bytes(value.to_vec()),
        value,
        from,
        Interpretation::Hex,
    ));
    out.parsed_map
        .insert("value_ascii".to_owned(), FieldValue::Text(safe_ascii(value)));
    out.parsed_map.insert(
        "value_length".to_owned(),
        FieldValue::Integer(i64::try_from(value.len()).unwrap_or(i64::MAX)),
    );
}

/// If `data` is an L2CAP frame addressed to the fixed ATT channel
/// (`0x0004`), strips the 4-byte header and returns the inner PDU. Returns
/// `None` for anything else — including a length mismatch, which is left
/// for the caller to treat as `Unknown` rather than a malformed L2CAP frame.
#[must_use]
pub fn unwrap_l2cap_att(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 4 {
        return None;
    }
    let length = le_u16(data, 0)?;
    let cid = le_u16(data, 2)?;
    if cid != 0x0004 || usize::from(length) + 4 != data.len() {
        return None;
    }
    Some(&data[4..])
}

/// Advertisement data type codes this core recognizes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AdvType {
    Flags,
    Uuid16,
    LocalName,
    ManufacturerData,
}

fn classify_adv_type(t: u8) -> Option<AdvType> {
    match t {
        0x01 => Some(AdvType::Flags),
        0x03 => Some(AdvType::Uuid16),
        0x09 => Some(AdvType::LocalName),
        0xFF => Some(AdvType::ManufacturerData),
        _ => None,
    }
}

/// Parses successive `{length, type, value[length-1]}` advertisement TLVs.
/// Truncation inside a TLV stops parsing and emits a warning; TLVs already
/// decoded are kept.
#[must_use]
pub fn dissect_advertisement(data: &[u8]) -> DissectionOutcome {
    let mut out = DissectionOutcome::default();
    let mut offset = 0usize;
    while offset < data.len() {
        let length = usize::from(data[offset]);
        if length == 0 {
            break;
        }
        let tlv_end = offset + 1 + length;
        if tlv_end > data.len() {
            out.warnings.push("truncated advertisement TLV".to_owned());
            break;
        }
        let adv_type = data[offset + 1];
        let value = &data[offset + 2..tlv_end];
        match classify_adv_type(adv_type) {
            Some(AdvType::Flags) => {
                if let Some(&flags) = value.first() {
                    out.push(ParsedField::new(
                        "flags",
                        FieldValue::Integer(i64::from(flags)),
                        value,
                        offset + 2,
                        Interpretation::Hex,
                    ));
                }
            }
            Some(AdvType::Uuid16) => {
                let uuids: Vec<String> = value
                    .chunks_exact(2)
                    .map(|c| format!("0x{:04X}", u16::from_le_bytes([c[0], c[1]])))
                    .collect();
                out.push(ParsedField::new(
                    "service_uuids",
                    FieldValue::Text(uuids.join(",")),
                    value,
                    offset + 2,
                    Interpretation::Uuid,
                ));
            }
            Some(AdvType::LocalName) => {
                out.push(ParsedField::new(
                    "local_name",
                    FieldValue::Text(safe_ascii(value)),
                    value,
                    offset + 2,
                    Interpretation::Ascii,
                ));
            }
            Some(AdvType::ManufacturerData) => {
                out.push(ParsedField::new(
                    "manufacturer_data",
                    FieldValue::Bytes(value.to_vec()),
                    value,
                    offset + 2,
                    Interpretation::Hex,
                ));
            }
            None => {}
        }
        offset = tlv_end;
    }
    out
}

/// Capability set a registered protocol handler must implement. Models
/// spec.md §9's "registry keyed by protocol tag" — new protocols register
/// another value here, no inheritance hierarchy required.
pub trait Dissector: Send + Sync {
    fn protocol(&self) -> Protocol;
    fn can_parse(&self, data: &[u8]) -> bool;
    fn parse(&self, data: &[u8]) -> DissectionOutcome;
}

/// ATT/GATT dissector, matching on a recognized first-byte opcode.
#[derive(Clone, Copy, Debug, Default)]
pub struct AttDissector;

impl Dissector for AttDissector {
    fn protocol(&self) -> Protocol {
        Protocol::Att
    }

    fn can_parse(&self, data: &[u8]) -> bool {
        detect_att_opcode(data).is_some()
    }

    fn parse(&self, data: &[u8]) -> DissectionOutcome {
        dissect_att(data)
    }
}

/// Advertisement TLV dissector.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdvertisementDissector;

impl Dissector for AdvertisementDissector {
    fn protocol(&self) -> Protocol {
        Protocol::Adv
    }

    fn can_parse(&self, _data: &[u8]) -> bool {
        true
    }

    fn parse(&self, data: &[u8]) -> DissectionOutcome {
        dissect_advertisement(data)
    }
}

/// Renders a 16-byte-per-row hex + ASCII dump, in the style of `xxd -g1`.
#[must_use]
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        let offset = row * 16;
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        out.push_str(&format!("{offset:04x}: {}  {}\n", hex.join(" "), safe_ascii(chunk)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request() {
        let result = dissect_att(&[0x0A, 0x03, 0x00]);
        assert_eq!(result.parsed_map["opcode_name"], FieldValue::Text("Read Request".to_owned()));
        assert_eq!(result.parsed_map["handle"], FieldValue::Text("0x0003".to_owned()));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn read_response_hello() {
        let result = dissect_att(&[0x0B, b'H', b'e', b'l', b'l', b'o']);
        assert_eq!(
            result.parsed_map["opcode_name"],
            FieldValue::Text("Read Response".to_owned())
        );
        assert_eq!(result.parsed_map["value_ascii"], FieldValue::Text("Hello".to_owned()));
        assert_eq!(result.parsed_map["value_length"], FieldValue::Integer(5));
    }

    #[test]
    fn error_response() {
        let result = dissect_att(&[0x01, 0x0A, 0x05, 0x00, 0x02]);
        assert_eq!(
            result.parsed_map["opcode_name"],
            FieldValue::Text("Error Response".to_owned())
        );
        assert_eq!(result.parsed_map["request_opcode"], FieldValue::Integer(0x0A));
        assert_eq!(result.parsed_map["handle"], FieldValue::Text("0x0005".to_owned()));
        assert_eq!(result.parsed_map["error_code"], FieldValue::Integer(2));
        assert_eq!(
            result.parsed_map["error_name"],
            FieldValue::Text("Read Not Permitted".to_owned())
        );
    }

    #[test]
    fn write_request() {
        let result = dissect_att(&[0x12, 0x10, 0x00, 0x01, 0x02]);
        assert_eq!(result.parsed_map["handle"], FieldValue::Text("0x0010".to_owned()));
        assert_eq!(result.parsed_map["value"], FieldValue::Bytes(vec![0x01, 0x02]));
    }

    #[test]
    fn truncated_att_pdu_warns() {
        let result = dissect_att(&[0x01, 0x0A]);
        assert!(result.warnings.contains(&"truncated".to_owned()));
    }

    #[test]
    fn unrecognized_opcode_warns() {
        let result = dissect_att(&[0xEE]);
        assert_eq!(result.warnings, vec!["unrecognized ATT opcode".to_owned()]);
    }

    #[test]
    fn l2cap_unwrap_recurses_into_att() {
        let mut data = vec![0x03, 0x00, 0x04, 0x00];
        data.extend_from_slice(&[0x0A, 0x03, 0x00]);
        let inner = unwrap_l2cap_att(&data).unwrap();
        let result = dissect_att(inner);
        assert_eq!(result.parsed_map["handle"], FieldValue::Text("0x0003".to_owned()));
    }

    #[test]
    fn l2cap_unwrap_rejects_wrong_cid() {
        let data = [0x03, 0x00, 0x05, 0x00, 0x0A, 0x03, 0x00];
        assert!(unwrap_l2cap_att(&data).is_none());
    }

    #[test]
    fn advertisement_tlvs() {
        let data = [0x02, 0x01, 0x06, 0x04, 0x09, b'A', b'B', b'C'];
        let result = dissect_advertisement(&data);
        assert_eq!(result.parsed_map["flags"], FieldValue::Integer(0x06));
        assert_eq!(result.parsed_map["local_name"], FieldValue::Text("ABC".to_owned()));
    }

    #[test]
    fn advertisement_truncated_tlv_warns_and_stops() {
        let data = [0x05, 0x09, b'A', b'B'];
        let result = dissect_advertisement(&data);
        assert!(result.warnings.contains(&"truncated advertisement TLV".to_owned()));
        assert!(result.parsed_fields.is_empty());
    }

    #[test]
    fn hex_dump_format() {
        let dump = hex_dump(&[0x00, 0x01, 0x02]);
        assert!(dump.starts_with("0000: 00 01 02"));
    }

    #[test]
    fn device_address_display() {
        let addr = DeviceAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
    }
}
