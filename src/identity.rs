use std::fmt;

/// A device identifier as published by the receiver, usually a MAC address
/// in its canonical textual form.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceIdentifier(String);

impl DeviceIdentifier {
    pub fn new(value: impl Into<String>) -> Self {
        DeviceIdentifier(value.into())
    }

    /// Decodes a raw message payload. The payload is the identifier's text with
    /// no framing, so anything that isn't non-empty UTF-8 is rejected.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match std::str::from_utf8(payload) {
            Ok(text) if !text.is_empty() => Some(DeviceIdentifier(text.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Case-insensitive comparison. Separators are not normalised, so
/// `aa-bb-..` never matches `AA:BB:..`.
pub fn matches(observed: &DeviceIdentifier, target: &DeviceIdentifier) -> bool {
    let (observed, target) = (observed.as_str(), target.as_str());
    if observed.is_ascii() && target.is_ascii() {
        return observed.eq_ignore_ascii_case(target);
    }
    observed
        .chars()
        .flat_map(char::to_lowercase)
        .eq(target.chars().flat_map(char::to_lowercase))
}
