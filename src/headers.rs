//! Wire contract for retry bookkeeping and provenance headers
//!
//! Header names and encodings follow the Kafka retry-topic convention so
//! records written by this crate interoperate with consumers of the same
//! topics written by other stacks. The attempts counter is a 4-byte
//! big-endian integer (a single legacy byte is still accepted on read), the
//! two timestamp bookkeeping headers use minimal two's-complement big-endian
//! bytes, and the provenance block uses fixed-width big-endian values plus
//! utf-8 strings.

use byteorder::{BigEndian, ByteOrder};
use rdkafka::message::{Headers, Message, Timestamp};
use tracing::debug;

/// Delivery-attempts counter, incremented on every forward.
pub const ATTEMPTS: &str = "retry_topic-attempts";
/// Timestamp of the first delivery of this record, set once.
pub const ORIGINAL_TIMESTAMP: &str = "retry_topic-original-timestamp";
/// Epoch millis before which the record must not be handled.
pub const BACKOFF_TIMESTAMP: &str = "retry_topic-backoff-timestamp";

/// Topic the record was first consumed from.
pub const SOURCE_TOPIC: &str = "kafka_original-topic";
/// Partition the record was first consumed from.
pub const SOURCE_PARTITION: &str = "kafka_original-partition";
/// Offset of the original record.
pub const SOURCE_OFFSET: &str = "kafka_original-offset";
/// Broker timestamp of the original record.
pub const SOURCE_TIMESTAMP: &str = "kafka_original-timestamp";
/// Timestamp type of the original record.
pub const SOURCE_TIMESTAMP_TYPE: &str = "kafka_original-timestamp-type";
/// Consumer group that first failed the record.
pub const SOURCE_CONSUMER_GROUP: &str = "kafka_original-consumer-group";

/// Class name of the routed fault.
pub const EXCEPTION_FQCN: &str = "kafka_exception-fqcn";
/// Class name of the fault's immediate cause, when present.
pub const EXCEPTION_CAUSE_FQCN: &str = "kafka_exception-cause-fqcn";
/// Message of the routed fault.
pub const EXCEPTION_MESSAGE: &str = "kafka_exception-message";
/// Rendered cause chain of the routed fault.
pub const EXCEPTION_STACKTRACE: &str = "kafka_exception-stacktrace";

const RETRY_BOOKKEEPING: [&str; 3] = [ATTEMPTS, ORIGINAL_TIMESTAMP, BACKOFF_TIMESTAMP];
const EXCEPTION_PROVENANCE: [&str; 4] = [
    EXCEPTION_FQCN,
    EXCEPTION_CAUSE_FQCN,
    EXCEPTION_MESSAGE,
    EXCEPTION_STACKTRACE,
];
const ORIGINAL_PROVENANCE: [&str; 6] = [
    SOURCE_TOPIC,
    SOURCE_PARTITION,
    SOURCE_OFFSET,
    SOURCE_TIMESTAMP,
    SOURCE_TIMESTAMP_TYPE,
    SOURCE_CONSUMER_GROUP,
];

/// Whether a header belongs to the retry bookkeeping block that is rewritten
/// on every forward.
pub fn is_retry_bookkeeping(name: &str) -> bool {
    RETRY_BOOKKEEPING.contains(&name)
}

/// Whether a header belongs to the exception provenance block.
pub fn is_exception_provenance(name: &str) -> bool {
    EXCEPTION_PROVENANCE.contains(&name)
}

/// Whether a header belongs to the original-record provenance block.
pub fn is_original_provenance(name: &str) -> bool {
    ORIGINAL_PROVENANCE.contains(&name)
}

/// Encodes a timestamp as minimal two's-complement big-endian bytes.
///
/// Redundant leading sign bytes are stripped, so `0` encodes to a single
/// zero byte and `-1` to a single `0xff` byte.
pub fn encode_timestamp(value: i64) -> Vec<u8> {
    let mut bytes = [0u8; 8];
    BigEndian::write_i64(&mut bytes, value);
    let mut start = 0;
    while start < 7 {
        let sign = if value < 0 { 0xff } else { 0x00 };
        if bytes[start] == sign && (bytes[start + 1] & 0x80) == (sign & 0x80) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

/// Decodes minimal two's-complement big-endian bytes back into an i64.
///
/// Empty input decodes to zero. Inputs longer than eight significant bytes
/// keep the low 64 bits, matching arbitrary-precision readers that narrow
/// to a long.
pub fn decode_timestamp(bytes: &[u8]) -> i64 {
    let mut value: i64 = match bytes.first() {
        Some(b) if b & 0x80 != 0 => -1,
        _ => 0,
    };
    for &b in bytes {
        value = (value << 8) | i64::from(b);
    }
    value
}

/// Encodes the attempts counter as 4 big-endian bytes.
pub fn encode_attempts(attempts: i32) -> [u8; 4] {
    let mut bytes = [0u8; 4];
    BigEndian::write_i32(&mut bytes, attempts);
    bytes
}

/// Decodes an attempts header value.
///
/// Four bytes are read big-endian; a single byte is accepted for
/// compatibility with writers that used a one-byte counter. Any other
/// length is rejected.
pub fn decode_attempts(bytes: &[u8]) -> Option<i32> {
    match bytes.len() {
        4 => Some(BigEndian::read_i32(bytes)),
        1 => Some(i32::from(bytes[0] as i8)),
        _ => None,
    }
}

/// Last value of the named header, if present.
pub fn last_header<'a, M: Message>(message: &'a M, name: &str) -> Option<&'a [u8]> {
    let headers = message.headers()?;
    let mut found = None;
    for i in 0..headers.count() {
        let header = headers.get(i);
        if header.key == name {
            found = header.value;
        }
    }
    found
}

/// Attempts made so far for this record. Absent or malformed headers count
/// as a first delivery.
pub fn read_attempts<M: Message>(message: &M) -> i32 {
    match last_header(message, ATTEMPTS) {
        None => 1,
        Some(bytes) => decode_attempts(bytes).unwrap_or_else(|| {
            debug!(
                header = ATTEMPTS,
                len = bytes.len(),
                "unexpected attempts header size, assuming first delivery"
            );
            1
        }),
    }
}

/// Timestamp of the record's first delivery: the bookkeeping header when
/// present, otherwise the record's own broker timestamp, otherwise the
/// given fallback.
pub fn read_original_timestamp<M: Message>(message: &M, fallback_ms: i64) -> i64 {
    match last_header(message, ORIGINAL_TIMESTAMP) {
        Some(bytes) => decode_timestamp(bytes),
        None => message.timestamp().to_millis().unwrap_or(fallback_ms),
    }
}

/// Due time of the record, if a backoff header is present.
pub fn read_backoff_timestamp<M: Message>(message: &M) -> Option<i64> {
    last_header(message, BACKOFF_TIMESTAMP).map(decode_timestamp)
}

/// Wire string for a record's timestamp type.
pub fn timestamp_type_name(timestamp: Timestamp) -> &'static str {
    match timestamp {
        Timestamp::CreateTime(_) => "CREATE_TIME",
        Timestamp::LogAppendTime(_) => "LOG_APPEND_TIME",
        Timestamp::NotAvailable => "NO_TIMESTAMP_TYPE",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::OwnedMessage;

    fn message_with_headers(headers: &[(&str, &[u8])]) -> OwnedMessage {
        let mut owned = rdkafka::message::OwnedHeaders::new();
        for (key, value) in headers {
            owned = owned.insert(rdkafka::message::Header {
                key,
                value: Some(*value),
            });
        }
        OwnedMessage::new(
            Some(b"payload".to_vec()),
            None,
            "orders".to_string(),
            Timestamp::CreateTime(1_600_000_000_000),
            0,
            7,
            Some(owned),
        )
    }

    #[test]
    fn timestamp_codec_is_minimal_twos_complement() {
        assert_eq!(encode_timestamp(0), vec![0x00]);
        assert_eq!(encode_timestamp(127), vec![0x7f]);
        assert_eq!(encode_timestamp(128), vec![0x00, 0x80]);
        assert_eq!(encode_timestamp(-1), vec![0xff]);
        assert_eq!(encode_timestamp(-129), vec![0xff, 0x7f]);
        assert_eq!(
            encode_timestamp(1_600_000_000_000),
            vec![0x01, 0x74, 0x87, 0x6e, 0x80, 0x00]
        );

        for v in [
            0,
            1,
            -1,
            127,
            128,
            -128,
            -129,
            255,
            256,
            1_600_000_000_000,
            i64::MAX,
            i64::MIN,
        ] {
            assert_eq!(decode_timestamp(&encode_timestamp(v)), v, "value {v}");
        }
    }

    #[test]
    fn decode_timestamp_tolerates_redundant_sign_bytes() {
        assert_eq!(decode_timestamp(&[0x00, 0x00, 0x7f]), 127);
        assert_eq!(decode_timestamp(&[0xff, 0xff, 0x80]), -128);
        assert_eq!(decode_timestamp(&[]), 0);
    }

    #[test]
    fn attempts_codec_accepts_legacy_single_byte() {
        assert_eq!(decode_attempts(&encode_attempts(7)), Some(7));
        assert_eq!(decode_attempts(&[5]), Some(5));
        assert_eq!(decode_attempts(&[0xff]), Some(-1));
        assert_eq!(decode_attempts(&[0, 1]), None);
        assert_eq!(decode_attempts(&[]), None);
    }

    #[test]
    fn read_attempts_defaults_to_first_delivery() {
        let no_header = message_with_headers(&[]);
        assert_eq!(read_attempts(&no_header), 1);

        let malformed = message_with_headers(&[(ATTEMPTS, &[1, 2][..])]);
        assert_eq!(read_attempts(&malformed), 1);

        let four_byte = message_with_headers(&[(ATTEMPTS, &encode_attempts(3)[..])]);
        assert_eq!(read_attempts(&four_byte), 3);
    }

    #[test]
    fn read_attempts_uses_last_occurrence() {
        let message = message_with_headers(&[
            (ATTEMPTS, &encode_attempts(2)[..]),
            (ATTEMPTS, &encode_attempts(5)[..]),
        ]);
        assert_eq!(read_attempts(&message), 5);
    }

    #[test]
    fn original_timestamp_falls_back_to_record_timestamp() {
        let message = message_with_headers(&[]);
        assert_eq!(
            read_original_timestamp(&message, 42),
            1_600_000_000_000,
        );

        let encoded = encode_timestamp(1_500_000_000_000);
        let with_header = message_with_headers(&[(ORIGINAL_TIMESTAMP, &encoded[..])]);
        assert_eq!(read_original_timestamp(&with_header, 42), 1_500_000_000_000);
    }

    #[test]
    fn backoff_timestamp_absent_without_header() {
        let message = message_with_headers(&[]);
        assert_eq!(read_backoff_timestamp(&message), None);

        let encoded = encode_timestamp(9_000);
        let with_header = message_with_headers(&[(BACKOFF_TIMESTAMP, &encoded[..])]);
        assert_eq!(read_backoff_timestamp(&with_header), Some(9_000));
    }

    #[test]
    fn header_blocks_are_disjoint() {
        assert!(is_retry_bookkeeping(ATTEMPTS));
        assert!(is_exception_provenance(EXCEPTION_STACKTRACE));
        assert!(is_original_provenance(SOURCE_TOPIC));
        assert!(!is_retry_bookkeeping(SOURCE_TOPIC));
        assert!(!is_exception_provenance(ATTEMPTS));
        assert!(!is_original_provenance(EXCEPTION_FQCN));
    }
}
