//! TXT metadata advertised by compute servers.
//!
//! Advertisers publish their attributes as a bracketed record, e.g.
//! `{0003=null}`. The device-type code is the byte at offset 1 and the
//! device count is the record length minus the 7 bytes of framing.

use crate::{Error, Result};

/// Bytes of framing around the device count in the metadata record.
pub const FRAMING_OVERHEAD: usize = 7;

const DEVICE_TYPE_OFFSET: usize = 1;

/// Kind of compute device a server advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Code `0`.
    Cpu,
    /// Code `1`.
    Gpu,
    /// Code `2`.
    Accelerator,
    /// Code `4`.
    Custom,
    /// Any other digit.
    Unknown,
}

impl DeviceType {
    /// Map a device-type digit to its variant.
    pub fn from_code(code: u8) -> Self {
        match code {
            b'0' => DeviceType::Cpu,
            b'1' => DeviceType::Gpu,
            b'2' => DeviceType::Accelerator,
            b'4' => DeviceType::Custom,
            _ => DeviceType::Unknown,
        }
    }
}

/// Parsed contents of a metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceMetadata {
    /// Advertised device kind.
    pub device_type: DeviceType,
    /// Number of advertised devices.
    pub device_count: usize,
}

impl ServiceMetadata {
    /// Parse a bracketed metadata record.
    pub fn parse(txt: &str) -> Result<Self> {
        let bytes = txt.as_bytes();
        if bytes.len() < FRAMING_OVERHEAD {
            return Err(Error::metadata(format!(
                "record {txt:?} shorter than framing ({FRAMING_OVERHEAD} bytes)"
            )));
        }
        if bytes[0] != b'{' || bytes[bytes.len() - 1] != b'}' {
            return Err(Error::metadata(format!("record {txt:?} is not bracketed")));
        }
        let code = bytes[DEVICE_TYPE_OFFSET];
        if !code.is_ascii_digit() {
            return Err(Error::metadata(format!(
                "record {txt:?} has no device-type digit"
            )));
        }
        Ok(Self {
            device_type: DeviceType::from_code(code),
            device_count: bytes.len() - FRAMING_OVERHEAD,
        })
    }
}

/// Render key/value attributes into the bracketed record form.
///
/// Keys without a value render as `key=null`.
pub fn render_attributes<'a, I>(attributes: I) -> String
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    let body: Vec<String> = attributes
        .into_iter()
        .map(|(key, value)| format!("{key}={}", value.unwrap_or("null")))
        .collect();
    format!("{{{}}}", body.join(", "))
}

/// Split a raw DNS TXT string into key and optional value.
pub fn split_attribute(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (raw, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_record() {
        let meta = ServiceMetadata::parse("{0003=null}").unwrap();
        assert_eq!(meta.device_type, DeviceType::Cpu);
        assert_eq!(meta.device_count, 4);
    }

    #[test]
    fn device_type_codes() {
        assert_eq!(DeviceType::from_code(b'1'), DeviceType::Gpu);
        assert_eq!(DeviceType::from_code(b'2'), DeviceType::Accelerator);
        assert_eq!(DeviceType::from_code(b'3'), DeviceType::Unknown);
        assert_eq!(DeviceType::from_code(b'4'), DeviceType::Custom);
        assert_eq!(DeviceType::from_code(b'9'), DeviceType::Unknown);
    }

    #[test]
    fn gpu_record_counts_extra_bytes() {
        let meta = ServiceMetadata::parse("{1000000=null}").unwrap();
        assert_eq!(meta.device_type, DeviceType::Gpu);
        assert_eq!(meta.device_count, 14 - FRAMING_OVERHEAD);
    }

    #[test]
    fn rejects_short_or_unframed_records() {
        assert!(ServiceMetadata::parse("{}").is_err());
        assert!(ServiceMetadata::parse("").is_err());
        assert!(ServiceMetadata::parse("0003=null").is_err());
        assert!(ServiceMetadata::parse("{x003=null}").is_err());
    }

    #[test]
    fn renders_attributes() {
        assert_eq!(render_attributes([("0003", None)]), "{0003=null}");
        assert_eq!(
            render_attributes([("a", Some("1")), ("b", None)]),
            "{a=1, b=null}"
        );
        assert_eq!(render_attributes(std::iter::empty()), "{}");
    }

    #[test]
    fn splits_dns_txt_strings() {
        assert_eq!(split_attribute("0003"), ("0003", None));
        assert_eq!(split_attribute("k=v=w"), ("k", Some("v=w")));
        assert_eq!(split_attribute("k="), ("k", Some("")));
    }
}
