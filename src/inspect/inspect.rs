//! Packet Inspector (C4): orchestrates protocol detection, dissection,
//! pattern analysis, security flagging, and anomaly checks per packet, then
//! folds the result into a bounded history and rolling statistics.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::pattern::HexPatternAnalyzer;
use crate::proto::{
    detect_att_opcode, dissect_advertisement, dissect_att, hex_dump, min_att_len, unwrap_l2cap_att,
    DeviceAddress, InspectionResult, PacketClass, PacketSource, ParsedFieldList, Protocol, RawPacket,
    SecurityFlags,
};
use crate::radio::RadioInterface;
use crate::SyncRwLock as RwLock;

/// Default bound on retained [`InspectionResult`]s (spec.md §3's `MAX_HISTORY`).
pub const MAX_HISTORY: usize = 1000;

const MAX_PAYLOAD_LEN: usize = 251;
const RSSI_STRONG_THRESHOLD: i16 = -20;
const RSSI_WEAK_THRESHOLD: i16 = -100;
const ENCRYPTED_ENTROPY_THRESHOLD: f64 = 7.2;
const ENCRYPTED_MIN_LEN: usize = 16;
const SIGNED_MIN_LEN: usize = 12;
const SIGNED_SUFFIX_LEN: usize = 12;
// A 12-byte window has at most 12 distinct values, capping its entropy at
// log2(12) =~ 3.585 bits/byte; ENCRYPTED_ENTROPY_THRESHOLD is unreachable
// here, so the signature suffix gets its own ceiling-appropriate bar.
const SIGNED_ENTROPY_THRESHOLD: f64 = 3.2;

/// Rolling counts over the current history window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Statistics {
    pub total_packets: usize,
    pub by_protocol: HashMap<String, usize>,
    pub by_security_flag: HashMap<String, usize>,
    pub by_source: HashMap<String, usize>,
    pub total_warnings: usize,
}

/// `{timestamp, inspection_result}` produced per packet, per spec.md §6 —
/// the counterpart to C5's `ConnectionEvent`, fanned out the same way.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct PacketEvent {
    pub timestamp: u64,
    pub inspection_result: InspectionResult,
}

/// Spawns the packet-ingest task spec.md §5 calls for: drains `radio`'s
/// `packet_stream()` in arrival order, feeds each packet through
/// `inspector.inspect()`, and publishes the result as a [`PacketEvent`].
///
/// Per-source ordering is preserved because one task reads one stream
/// serially; feeding one inspector from multiple radios means spawning one
/// ingest task per radio; spec.md §5 explicitly leaves cross-source
/// ordering unguaranteed in that case. Cancelling `cancel` stops the task
/// after its current packet finishes inspection.
pub fn spawn_packet_ingest(
    radio: Arc<dyn RadioInterface>,
    inspector: Arc<PacketInspector>,
    events: broadcast::Sender<PacketEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = radio.packet_stream();
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                packet = stream.next() => packet,
            };
            let Some(packet) = next else { break };
            let inspection_result = inspector.inspect(&packet);
            let _ = events.send(PacketEvent {
                timestamp: packet.timestamp,
                inspection_result,
            });
        }
    })
}

/// Orchestrates C1–C3 per packet and retains a bounded, FIFO history.
/// `history`/`statistics` are guarded by a single `RwLock` each: the
/// inspector itself is the sole writer (per spec.md §5), so readers via
/// [`Self::get_statistics`]/[`Self::history`] never race a concurrent append.
#[derive(Debug)]
pub struct PacketInspector {
    analyzer: HexPatternAnalyzer,
    history: RwLock<std::collections::VecDeque<InspectionResult>>,
    statistics: RwLock<Statistics>,
    max_history: usize,
}

impl Default for PacketInspector {
    fn default() -> Self {
        Self::new(MAX_HISTORY)
    }
}

impl PacketInspector {
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            analyzer: HexPatternAnalyzer::default(),
            history: RwLock::new(std::collections::VecDeque::with_capacity(max_history.min(4096))),
            statistics: RwLock::new(Statistics::default()),
            max_history,
        }
    }

    /// Runs the full pipeline over `packet` and returns the resulting
    /// [`InspectionResult`], which is also folded into history/statistics.
    pub fn inspect(&self, packet: &RawPacket) -> InspectionResult {
        trace!(address = %packet.address, len = packet.payload.len(), "inspecting packet");
        let payload = &packet.payload;
        let data_length = payload.len();
        let protocol = detect_protocol(packet);

        let (parsed_fields, parsed_map, mut warnings) = dissect(protocol, payload);

        let pattern_summary = self.analyzer.analyze(payload);
        let security_flags = security_flags(payload, &mut warnings).names();

        anomaly_checks(packet, &mut warnings);

        let result = InspectionResult {
            timestamp: packet.timestamp,
            address: packet.address,
            source: packet.source,
            rssi: packet.rssi,
            data_length,
            detected_protocol: protocol,
            parsed_fields,
            parsed_map,
            security_flags,
            warnings,
            hex_dump: hex_dump(payload),
            pattern_summary,
        };

        self.record(&result, packet.source);
        result
    }

    fn record(&self, result: &InspectionResult, source: PacketSource) {
        {
            let mut history = self.history.write();
            if history.len() >= self.max_history {
                history.pop_front();
            }
            history.push_back(result.clone());
        }
        let mut stats = self.statistics.write();
        stats.total_packets += 1;
        *stats.by_protocol.entry(result.detected_protocol.to_string()).or_insert(0) += 1;
        *stats.by_source.entry(source.to_string()).or_insert(0) += 1;
        stats.total_warnings += result.warnings.len();
        for flag in &result.security_flags {
            *stats.by_security_flag.entry(flag.clone()).or_insert(0) += 1;
        }
    }

    /// Snapshot of the current rolling statistics.
    #[must_use]
    pub fn get_statistics(&self) -> Statistics {
        self.statistics.read().clone()
    }

    /// Snapshot of the bounded history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<InspectionResult> {
        self.history.read().iter().cloned().collect()
    }

    /// Number of results currently retained (`<= max_history`).
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

/// Protocol detection, ordered rules per spec.md §4.4 (first match wins).
fn detect_protocol(packet: &RawPacket) -> Protocol {
    if packet.packet_class == PacketClass::Advertisement {
        return Protocol::Adv;
    }
    if let Some(opcode) = detect_att_opcode(&packet.payload) {
        if packet.payload.len() >= min_att_len(opcode) {
            return Protocol::Att;
        }
    }
    if unwrap_l2cap_att(&packet.payload).is_some() {
        return Protocol::L2capAtt;
    }
    Protocol::Unknown
}

#[allow(clippy::type_complexity)]
fn dissect(
    protocol: Protocol,
    payload: &[u8],
) -> (ParsedFieldList, HashMap<String, crate::proto::FieldValue>, Vec<String>) {
    match protocol {
        Protocol::Att => {
            let outcome = dissect_att(payload);
            (outcome.parsed_fields, outcome.parsed_map, outcome.warnings)
        }
        Protocol::L2capAtt => {
            let inner = unwrap_l2cap_att(payload).unwrap_or(payload);
            let outcome = dissect_att(inner);
            (outcome.parsed_fields, outcome.parsed_map, outcome.warnings)
        }
        Protocol::Adv => {
            let outcome = dissect_advertisement(payload);
            (outcome.parsed_fields, outcome.parsed_map, outcome.warnings)
        }
        Protocol::Unknown => (ParsedFieldList::new(), HashMap::new(), Vec::new()),
    }
}

/// Non-exclusive security heuristics, per spec.md §4.4. The SMP/ATT-Error
/// ambiguity is surfaced as an additional warning rather than resolved,
/// since a bare `RawPacket` carries no L2CAP CID to disambiguate by.
fn security_flags(payload: &[u8], warnings: &mut Vec<String>) -> SecurityFlags {
    let mut flags = SecurityFlags::empty();

    if payload.len() >= 2 && payload[0] == 0x01 && payload[1] <= 0x04 && (6..=7).contains(&payload.len()) {
        flags.insert(SecurityFlags::PAIRING_REQUEST);
        warnings.push("ambiguous: 0x01 may be SMP Pairing Request or ATT Error Response".to_owned());
    }

    let entropy = bluefusion_crypto::shannon_entropy(payload);
    if entropy >= ENCRYPTED_ENTROPY_THRESHOLD && payload.len() >= ENCRYPTED_MIN_LEN {
        flags.insert(SecurityFlags::ENCRYPTED);
    }

    if payload.len() >= SIGNED_MIN_LEN {
        let suffix = &payload[payload.len() - SIGNED_SUFFIX_LEN..];
        if bluefusion_crypto::shannon_entropy(suffix) >= SIGNED_ENTROPY_THRESHOLD {
            flags.insert(SecurityFlags::SIGNED);
        }
    }

    flags
}

fn anomaly_checks(packet: &RawPacket, warnings: &mut Vec<String>) {
    if packet.payload.len() > MAX_PAYLOAD_LEN {
        warnings.push("exceeds BLE 4.2 maximum payload".to_owned());
    }
    if packet.rssi > RSSI_STRONG_THRESHOLD {
        warnings.push("Unusual RSSI (too strong)".to_owned());
    }
    if packet.rssi < RSSI_WEAK_THRESHOLD {
        warnings.push("Unusual RSSI (too weak)".to_owned());
    }
    // Checked independent of the detected protocol: a packet shorter than
    // its opcode's minimum never classifies as `Att` (detection rule 2
    // requires the minimum length), but it is still a truncated ATT PDU.
    if let Some(opcode) = detect_att_opcode(&packet.payload) {
        if packet.payload.len() < min_att_len(opcode) {
            warnings.push("truncated ATT PDU".to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(payload: Vec<u8>, rssi: i16, class: PacketClass) -> RawPacket {
        RawPacket {
            timestamp: 0,
            source: PacketSource::HostRadio,
            address: DeviceAddress::new([1, 2, 3, 4, 5, 6]),
            rssi,
            payload,
            packet_class: class,
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn read_request_is_att() {
        let inspector = PacketInspector::default();
        let result = inspector.inspect(&packet(vec![0x0A, 0x03, 0x00], -50, PacketClass::Data));
        assert_eq!(result.detected_protocol, Protocol::Att);
        assert_eq!(result.data_length, 3);
    }

    #[test]
    fn advertisement_class_short_circuits_detection() {
        let inspector = PacketInspector::default();
        let result = inspector.inspect(&packet(vec![0x02, 0x01, 0x06], -50, PacketClass::Advertisement));
        assert_eq!(result.detected_protocol, Protocol::Adv);
    }

    #[test]
    fn l2cap_over_att_detected() {
        let inspector = PacketInspector::default();
        let mut payload = vec![0x03, 0x00, 0x04, 0x00];
        payload.extend_from_slice(&[0x0A, 0x03, 0x00]);
        let result = inspector.inspect(&packet(payload, -50, PacketClass::Data));
        assert_eq!(result.detected_protocol, Protocol::L2capAtt);
    }

    #[test]
    fn unknown_protocol_for_arbitrary_bytes() {
        let inspector = PacketInspector::default();
        let result = inspector.inspect(&packet(vec![0xEE, 0xEE], -50, PacketClass::Data));
        assert_eq!(result.detected_protocol, Protocol::Unknown);
    }

    #[test]
    fn empty_payload_has_no_protocol_and_no_warnings() {
        let inspector = PacketInspector::default();
        let result = inspector.inspect(&packet(Vec::new(), -50, PacketClass::Data));
        assert_eq!(result.detected_protocol, Protocol::Unknown);
        assert!(result.warnings.is_empty());
        assert_eq!(result.pattern_summary.entropy, 0.0);
    }

    #[test]
    fn oversized_payload_warns() {
        let inspector = PacketInspector::default();
        let ok = inspector.inspect(&packet(vec![0u8; 251], -50, PacketClass::Data));
        assert!(!ok.warnings.iter().any(|w| w.contains("maximum payload")));
        let bad = inspector.inspect(&packet(vec![0u8; 252], -50, PacketClass::Data));
        assert!(bad.warnings.iter().any(|w| w.contains("maximum payload")));
    }

    #[test]
    fn rssi_boundaries() {
        let inspector = PacketInspector::default();
        let ok_strong = inspector.inspect(&packet(vec![0u8; 4], -20, PacketClass::Data));
        assert!(!ok_strong.warnings.iter().any(|w| w.contains("too strong")));
        let bad_strong = inspector.inspect(&packet(vec![0u8; 4], -19, PacketClass::Data));
        assert!(bad_strong.warnings.iter().any(|w| w.contains("too strong")));

        let ok_weak = inspector.inspect(&packet(vec![0u8; 4], -100, PacketClass::Data));
        assert!(!ok_weak.warnings.iter().any(|w| w.contains("too weak")));
        let bad_weak = inspector.inspect(&packet(vec![0u8; 4], -101, PacketClass::Data));
        assert!(bad_weak.warnings.iter().any(|w| w.contains("too weak")));
    }

    #[test]
    fn truncated_att_pdu_warns() {
        let inspector = PacketInspector::default();
        let result = inspector.inspect(&packet(vec![0x01, 0x0A], -50, PacketClass::Data));
        assert!(result.warnings.iter().any(|w| w == "truncated ATT PDU" || w == "truncated"));
    }

    #[test]
    fn history_is_bounded_fifo() {
        let inspector = PacketInspector::new(3);
        for i in 0..5u8 {
            inspector.inspect(&packet(vec![i], -50, PacketClass::Data));
        }
        let history = inspector.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].data_length, 1);
        assert_eq!(inspector.get_statistics().total_packets, 5);
    }

    #[test]
    fn statistics_count_by_protocol_and_source() {
        let inspector = PacketInspector::default();
        inspector.inspect(&packet(vec![0x0A, 0x03, 0x00], -50, PacketClass::Data));
        inspector.inspect(&packet(vec![0xEE], -50, PacketClass::Data));
        let stats = inspector.get_statistics();
        assert_eq!(stats.by_protocol["ATT"], 1);
        assert_eq!(stats.by_protocol["Unknown"], 1);
        assert_eq!(stats.by_source["HostRadio"], 2);
    }

    #[test]
    fn encrypted_flag_requires_high_entropy_and_min_length() {
        let inspector = PacketInspector::default();
        let high_entropy: Vec<u8> = (0..=255u16).map(|i| i as u8).collect();
        let result = inspector.inspect(&packet(high_entropy, -50, PacketClass::Data));
        assert!(result.security_flags.contains(&"encrypted".to_owned()));
    }

    #[tokio::test]
    async fn packet_ingest_feeds_inspector_in_order() {
        use crate::radio::ReplayRadio;

        let packets = vec![
            packet(vec![0x0A, 0x03, 0x00], -50, PacketClass::Data),
            packet(vec![0x0B, b'H', b'i'], -50, PacketClass::Data),
        ];
        let radio: Arc<dyn RadioInterface> = Arc::new(ReplayRadio::new(packets));
        let inspector = Arc::new(PacketInspector::default());
        let (tx, mut rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();

        let handle = spawn_packet_ingest(radio, Arc::clone(&inspector), tx, cancel.clone());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.inspection_result.detected_protocol, Protocol::Att);
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second.inspection_result.parsed_map["opcode_name"],
            crate::proto::FieldValue::Text("Read Response".to_owned())
        );

        cancel.cancel();
        let _ = handle.await;
        assert_eq!(inspector.get_statistics().total_packets, 2);
    }
}
