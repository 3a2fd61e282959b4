//! `cenc` init data: one or more concatenated PSSH boxes.
//!
//! Clear Key only understands the common-format box
//! (`1077efec-c0b2-4d02-ace3-3c1e52e2fb4b`, version 1), whose key id list
//! names the keys a session must request. Boxes for other systems are parsed
//! and skipped.
use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

use crate::error::{Error, Result};

/// W3C common PSSH system id.
pub const COMMON_SYSTEM_ID: Uuid = Uuid::from_u128(0x1077efecc0b24d02ace33c1e52e2fb4b);

/// Largest init data accepted, in bytes.
pub const MAX_INIT_DATA_LEN: usize = 64 * 1024;

/// One parsed PSSH box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pssh {
    pub version: u8,
    pub flags: u32,
    pub system_id: Uuid,
    pub key_ids: Vec<Uuid>,
    pub data: Vec<u8>,
}

impl Pssh {
    /// Create a box. Key ids need version 1.
    pub fn new(system_id: Uuid, key_ids: Vec<Uuid>, data: Vec<u8>, version: u8) -> Result<Self> {
        if version > 1 {
            return Err(Error::InvalidInitData(format!(
                "Unsupported PSSH version: {}",
                version
            )));
        }
        if version == 0 && !key_ids.is_empty() {
            return Err(Error::InvalidInitData(
                "Version 0 PSSH boxes cannot carry key ids".to_string(),
            ));
        }
        Ok(Self {
            version,
            flags: 0,
            system_id,
            key_ids,
            data,
        })
    }

    /// Common-format box listing `key_ids`.
    pub fn common(key_ids: Vec<Uuid>) -> Self {
        Self {
            version: 1,
            flags: 0,
            system_id: COMMON_SYSTEM_ID,
            key_ids,
            data: Vec::new(),
        }
    }

    pub fn is_common(&self) -> bool {
        self.system_id == COMMON_SYSTEM_ID
    }

    /// Serialize as a full box.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(self.version);
        body.extend_from_slice(&self.flags.to_be_bytes()[1..]);
        body.extend_from_slice(self.system_id.as_bytes());

        if self.version == 1 {
            body.extend_from_slice(&(self.key_ids.len() as u32).to_be_bytes());
            for kid in self.key_ids.iter() {
                body.extend_from_slice(kid.as_bytes());
            }
        }

        body.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        body.extend_from_slice(&self.data);

        let mut out = Vec::with_capacity(body.len() + 8);
        out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(b"pssh");
        out.extend_from_slice(&body);
        out
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }
}

/// Parse every box of a `cenc` init data blob.
pub fn parse_boxes(data: &[u8]) -> Result<Vec<Pssh>> {
    if data.is_empty() {
        return Err(Error::InvalidInitData("Init data must not be empty".to_string()));
    }
    if data.len() > MAX_INIT_DATA_LEN {
        return Err(Error::InvalidInitData(format!(
            "Init data is {} bytes; limit is {}",
            data.len(),
            MAX_INIT_DATA_LEN
        )));
    }

    let mut boxes = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (pssh, used) = parse_box(rest)?;
        boxes.push(pssh);
        rest = &rest[used..];
    }
    Ok(boxes)
}

/// Key ids named by the common-format boxes of `data`, in order, without
/// duplicates.
pub fn common_key_ids(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut key_ids: Vec<Vec<u8>> = Vec::new();
    for pssh in parse_boxes(data)?.iter().filter(|p| p.is_common()) {
        for kid in pssh.key_ids.iter() {
            let kid = kid.as_bytes().to_vec();
            if !key_ids.contains(&kid) {
                key_ids.push(kid);
            }
        }
    }
    if key_ids.is_empty() {
        return Err(Error::InvalidInitData(
            "No common-format PSSH box with key ids".to_string(),
        ));
    }
    Ok(key_ids)
}

/// Parse one box at the start of `data`; returns it with its length.
fn parse_box(data: &[u8]) -> Result<(Pssh, usize)> {
    if data.len() < 8 {
        return Err(Error::InvalidInitData("PSSH box too short".to_string()));
    }

    let size = BigEndian::read_u32(&data[0..4]) as usize;
    if &data[4..8] != b"pssh" {
        return Err(Error::InvalidInitData("Not a PSSH box".to_string()));
    }
    if size < 8 + 4 + 16 + 4 || size > data.len() {
        return Err(Error::InvalidInitData(format!(
            "Bad PSSH box size {} for {} bytes",
            size,
            data.len()
        )));
    }
    let body = &data[8..size];

    let version = body[0];
    if version > 1 {
        return Err(Error::InvalidInitData(format!(
            "Unsupported PSSH version: {}",
            version
        )));
    }
    let flags = BigEndian::read_u24(&body[1..4]);
    let system_id = Uuid::from_slice(&body[4..20])
        .map_err(|_| Error::InvalidInitData("Invalid system ID".to_string()))?;
    let mut offset = 20;

    let mut key_ids = Vec::new();
    if version == 1 {
        if body.len() < offset + 4 {
            return Err(Error::InvalidInitData("Missing KID count".to_string()));
        }
        let kid_count = BigEndian::read_u32(&body[offset..offset + 4]) as usize;
        offset += 4;

        let end = kid_count
            .checked_mul(16)
            .and_then(|len| len.checked_add(offset))
            .filter(|end| *end <= body.len())
            .ok_or_else(|| Error::InvalidInitData("Missing KIDs".to_string()))?;
        for chunk in body[offset..end].chunks_exact(16) {
            key_ids.push(
                Uuid::from_slice(chunk)
                    .map_err(|_| Error::InvalidInitData("Invalid key id".to_string()))?,
            );
        }
        offset = end;
    }

    if body.len() < offset + 4 {
        return Err(Error::InvalidInitData("Missing init data length".to_string()));
    }
    let data_size = BigEndian::read_u32(&body[offset..offset + 4]) as usize;
    offset += 4;
    if body.len() != offset + data_size {
        return Err(Error::InvalidInitData(
            "PSSH data length does not match box size".to_string(),
        ));
    }

    Ok((
        Pssh {
            version,
            flags,
            system_id,
            key_ids,
            data: body[offset..].to_vec(),
        },
        size,
    ))
}

#[cfg(test)]
mod tests {
    use super::{common_key_ids, parse_boxes, Pssh, COMMON_SYSTEM_ID};
    use uuid::Uuid;

    const WIDEVINE: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);

    #[test]
    fn common_box_key_ids_are_extracted() {
        let kid = Uuid::new_v4();
        let bytes = Pssh::common(vec![kid]).to_bytes();

        let boxes = parse_boxes(&bytes).expect("parse boxes");
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].system_id, COMMON_SYSTEM_ID);
        assert_eq!(common_key_ids(&bytes).expect("key ids"), vec![kid.as_bytes().to_vec()]);
    }

    #[test]
    fn foreign_boxes_are_skipped() {
        let kid = Uuid::new_v4();
        let mut bytes = Pssh::new(WIDEVINE, vec![], b"opaque".to_vec(), 0)
            .expect("create pssh")
            .to_bytes();
        bytes.extend(Pssh::common(vec![kid, kid]).to_bytes());

        let boxes = parse_boxes(&bytes).expect("parse boxes");
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].data, b"opaque");
        assert_eq!(common_key_ids(&bytes).expect("key ids").len(), 1);
    }

    #[test]
    fn init_data_without_common_box_is_rejected() {
        let bytes = Pssh::new(WIDEVINE, vec![], vec![1, 2], 0)
            .expect("create pssh")
            .to_bytes();
        assert!(common_key_ids(&bytes).is_err());
    }

    #[test]
    fn truncated_box_is_rejected() {
        let bytes = Pssh::common(vec![Uuid::new_v4()]).to_bytes();
        assert!(parse_boxes(&bytes[..bytes.len() - 1]).is_err());
        assert!(parse_boxes(&[]).is_err());
        assert!(parse_boxes(b"\x00\x00\x00\x08moov").is_err());
    }

    #[test]
    fn version_zero_rejects_key_ids() {
        let err = Pssh::new(COMMON_SYSTEM_ID, vec![Uuid::nil()], vec![], 0)
            .expect_err("v0 with key ids");
        assert!(format!("{}", err).contains("Version 0"));
    }
}
