//! Call metadata carried by handshakes, requests and responses.

use crate::binary;
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes};
use std::collections::BTreeMap;

/// String keys mapped to raw byte values.
///
/// Entries are kept ordered so that encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(BTreeMap<String, Bytes>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Bytes> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Encodes the metadata as a `map<bytes>`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        binary::put_bytes_map(buf, self.0.iter().map(|(k, v)| (k.as_str(), v.as_ref())));
    }

    /// Decodes a `map<bytes>`, naming `field` in errors.
    pub fn decode(buf: &mut impl Buf, field: &'static str) -> Result<Self, ProtocolError> {
        let mut metadata = Self::new();
        binary::get_bytes_map(buf, field, |key, value| {
            metadata.0.insert(key, value);
        })?;
        Ok(metadata)
    }
}

impl<K: Into<String>, V: Into<Bytes>> FromIterator<(K, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut metadata = Metadata::new();
        metadata.set("test", vec![0x01u8]);

        assert_eq!(metadata.get("test").map(|v| &v[..]), Some(&[0x01][..]));
        assert_eq!(metadata.len(), 1);
    }

    #[test]
    fn test_get_missing_key() {
        let metadata = Metadata::default();
        assert!(metadata.get("test").is_none());
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_absent_map_reads_as_empty() {
        let absent: Option<Metadata> = None;
        assert!(absent.unwrap_or_default().get("anything").is_none());
    }

    #[test]
    fn test_encoding_is_ordered() {
        let a: Metadata = [("b", &b"2"[..]), ("a", &b"1"[..])]
            .into_iter()
            .map(|(k, v)| (k, Bytes::copy_from_slice(v)))
            .collect();
        let b: Metadata = [("a", &b"1"[..]), ("b", &b"2"[..])]
            .into_iter()
            .map(|(k, v)| (k, Bytes::copy_from_slice(v)))
            .collect();

        let mut ea = Vec::new();
        let mut eb = Vec::new();
        a.encode(&mut ea);
        b.encode(&mut eb);
        assert_eq!(ea, eb);

        let decoded = Metadata::decode(&mut &ea[..], "metadata").unwrap();
        assert_eq!(decoded, a);
    }

    #[test]
    fn test_decode_error_names_field() {
        let err = Metadata::decode(&mut &[0x02u8][..], "response metadata").unwrap_err();
        assert!(err.to_string().contains("response metadata"));
    }
}
