// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded signature data structures.
//!
//! Code signatures are stored in a *SuperBlob*: a header followed by an
//! index of (slot, offset) pairs and then the individual blob payloads.
//! All integers are big-endian. Each blob itself starts with an 8 byte
//! header holding its magic and total length.

use {
    crate::error::{Error, Result},
    scroll::{IOwrite, Pread},
    std::{borrow::Cow, cmp::Ordering, collections::HashMap, fmt::Debug, io::Write},
};

/// Magic constants identifying blob types.
pub mod magic {
    pub const REQUIREMENT: u32 = 0xfade0c00;
    pub const REQUIREMENT_SET: u32 = 0xfade0c01;
    pub const CODE_DIRECTORY: u32 = 0xfade0c02;
    pub const EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
    pub const ENTITLEMENTS: u32 = 0xfade7171;
    pub const ENTITLEMENTS_DER: u32 = 0xfade7172;
    pub const BLOB_WRAPPER: u32 = 0xfade0b01;
}

/// Slots within a superblob index.
///
/// Slots with a standard digest participate in the code directory's
/// special hash array, where they are addressed as negative indices.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Slot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    Application,
    Entitlements,
    EntitlementsDer,
    AlternateCodeDirectory(u32),
    Signature,
    Unknown(u32),
}

impl From<u32> for Slot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::Application,
            5 => Self::Entitlements,
            7 => Self::EntitlementsDer,
            0x1000..=0x1005 => Self::AlternateCodeDirectory(v),
            0x10000 => Self::Signature,
            _ => Self::Unknown(v),
        }
    }
}

impl From<Slot> for u32 {
    fn from(s: Slot) -> Self {
        match s {
            Slot::CodeDirectory => 0,
            Slot::Info => 1,
            Slot::RequirementSet => 2,
            Slot::ResourceDir => 3,
            Slot::Application => 4,
            Slot::Entitlements => 5,
            Slot::EntitlementsDer => 7,
            Slot::AlternateCodeDirectory(v) => v,
            Slot::Signature => 0x10000,
            Slot::Unknown(v) => v,
        }
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl Slot {
    /// The index this slot occupies in a code directory's special hash array.
    pub fn special_hash_index(&self) -> Option<u32> {
        match self {
            Slot::Info => Some(1),
            Slot::RequirementSet => Some(2),
            Slot::ResourceDir => Some(3),
            Slot::Application => Some(4),
            Slot::Entitlements => Some(5),
            Slot::EntitlementsDer => Some(7),
            // Unassigned low indexes still occupy a special hash array
            // position and must survive a parse/serialize cycle.
            Slot::Unknown(n) if (1..0x1000).contains(n) => Some(*n),
            _ => None,
        }
    }
}

/// Hash algorithms used by code directories.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestKind {
    Sha1,
    Sha256,
    /// SHA-256 truncated to 20 bytes, for SHA-1 sized compatibility.
    Sha256Truncated,
    Sha384,
    Sha512,
}

impl TryFrom<u8> for DigestKind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Sha1),
            2 => Ok(Self::Sha256),
            3 => Ok(Self::Sha256Truncated),
            4 => Ok(Self::Sha384),
            5 => Ok(Self::Sha512),
            _ => Err(Error::UnknownDigestType(v)),
        }
    }
}

impl From<DigestKind> for u8 {
    fn from(k: DigestKind) -> Self {
        match k {
            DigestKind::Sha1 => 1,
            DigestKind::Sha256 => 2,
            DigestKind::Sha256Truncated => 3,
            DigestKind::Sha384 => 4,
            DigestKind::Sha512 => 5,
        }
    }
}

impl DigestKind {
    pub fn hash_len(&self) -> usize {
        match self {
            Self::Sha1 | Self::Sha256Truncated => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    fn hasher(&self) -> ring::digest::Context {
        ring::digest::Context::new(match self {
            Self::Sha1 => &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 | Self::Sha256Truncated => &ring::digest::SHA256,
            Self::Sha384 => &ring::digest::SHA384,
            Self::Sha512 => &ring::digest::SHA512,
        })
    }

    pub fn digest_data(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        let mut digest = hasher.finish().as_ref().to_vec();
        if matches!(self, Self::Sha256Truncated) {
            digest.truncate(20);
        }
        digest
    }
}

/// A computed hash value.
#[derive(Clone, Eq, PartialEq)]
pub struct Digest<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Digest<'a> {
    pub fn to_owned(&self) -> Digest<'static> {
        Digest {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }

    pub fn as_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

impl<'a> Debug for Digest<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// Parse a blob header, returning (magic, declared length, payload after header).
pub fn read_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8])> {
    let magic = data.pread_with::<u32>(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)? as usize;

    if length < 8 || length > data.len() {
        return Err(Error::SuperblobMalformed);
    }

    Ok((magic, length, &data[8..length]))
}

pub(crate) fn read_and_validate_blob_header(data: &[u8], expected: u32) -> Result<&[u8]> {
    let (magic, _, payload) = read_blob_header(data)?;

    if magic != expected {
        Err(Error::SuperblobMalformed)
    } else {
        Ok(payload)
    }
}

/// Serialize a superblob from already-serialized blob bytes, keyed by slot.
///
/// The index is emitted in ascending slot order. Offsets are relative to
/// the start of the superblob.
pub fn create_superblob(magic: u32, blobs: &[(Slot, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());

    // magic + total length + blob count + (slot, offset) index entries.
    let mut total_length = 4 + 4 + 4 + (blobs.len() * 8);
    let mut indices = Vec::with_capacity(blobs.len());

    for (slot, blob) in blobs {
        indices.push((u32::from(*slot), total_length as u32));
        total_length += blob.len();
    }

    cursor.iowrite_with(magic, scroll::BE)?;
    cursor.iowrite_with(total_length as u32, scroll::BE)?;
    cursor.iowrite_with(blobs.len() as u32, scroll::BE)?;
    for (slot, offset) in indices {
        cursor.iowrite_with(slot, scroll::BE)?;
        cursor.iowrite_with(offset, scroll::BE)?;
    }
    for (_, blob) in blobs {
        cursor.write_all(blob)?;
    }

    Ok(cursor.into_inner())
}

/// Common behavior for structured blobs.
pub trait Blob<'a>
where
    Self: Sized,
{
    fn magic() -> u32;

    /// Parse from the full blob data, including the 8 byte header.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self>;

    /// Serialize the payload following the blob header.
    fn serialize_payload(&self) -> Result<Vec<u8>>;

    /// Serialize to bytes, including the blob header.
    fn to_blob_bytes(&self) -> Result<Vec<u8>> {
        let mut payload = self.serialize_payload()?;
        let mut data = Vec::with_capacity(payload.len() + 8);
        data.iowrite_with(Self::magic(), scroll::BE)?;
        data.iowrite_with(payload.len() as u32 + 8, scroll::BE)?;
        data.append(&mut payload);

        Ok(data)
    }

    fn digest_with(&self, kind: DigestKind) -> Result<Vec<u8>> {
        Ok(kind.digest_data(&self.to_blob_bytes()?))
    }
}

/// A set of code requirements, keyed by requirement type.
///
/// Requirement expressions are carried opaque; this crate emits empty sets
/// and round-trips whatever an existing signature holds.
#[derive(Clone, Debug, Default)]
pub struct RequirementSetBlob<'a> {
    pub requirements: Vec<(u32, Cow<'a, [u8]>)>,
}

impl<'a> Blob<'a> for RequirementSetBlob<'a> {
    fn magic() -> u32 {
        magic::REQUIREMENT_SET
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self> {
        read_and_validate_blob_header(data, Self::magic())?;

        // Offsets in the index are relative to the start of the blob.
        let count = data.pread_with::<u32>(8, scroll::BE)?;

        let mut requirements = Vec::with_capacity(count as usize);

        for i in 0..count as usize {
            let flavor = data.pread_with::<u32>(12 + i * 8, scroll::BE)?;
            let offset = data.pread_with::<u32>(16 + i * 8, scroll::BE)? as usize;

            if offset >= data.len() {
                return Err(Error::SuperblobMalformed);
            }

            let (_, length, _) = read_blob_header(&data[offset..])?;
            requirements.push((flavor, Cow::Borrowed(&data[offset..offset + length])));
        }

        Ok(Self { requirements })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>> {
        let mut cursor = std::io::Cursor::new(Vec::new());

        let mut offset = 8 + 4 + (self.requirements.len() * 8);

        cursor.iowrite_with(self.requirements.len() as u32, scroll::BE)?;
        for (flavor, req) in &self.requirements {
            cursor.iowrite_with(*flavor, scroll::BE)?;
            cursor.iowrite_with(offset as u32, scroll::BE)?;
            offset += req.len();
        }
        for (_, req) in &self.requirements {
            cursor.write_all(req)?;
        }

        Ok(cursor.into_inner())
    }
}

/// XML entitlements, stored as a plist string.
#[derive(Clone, Debug)]
pub struct EntitlementsBlob<'a> {
    plist: Cow<'a, str>,
}

impl<'a> EntitlementsBlob<'a> {
    pub fn from_string(s: &(impl ToString + ?Sized)) -> Self {
        Self {
            plist: Cow::Owned(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.plist
    }
}

impl<'a> Blob<'a> for EntitlementsBlob<'a> {
    fn magic() -> u32 {
        magic::ENTITLEMENTS
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self> {
        let payload = read_and_validate_blob_header(data, Self::magic())?;
        let plist = std::str::from_utf8(payload)
            .map_err(|_| Error::SuperblobMalformed)?;

        Ok(Self {
            plist: Cow::Borrowed(plist),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>> {
        Ok(self.plist.as_bytes().to_vec())
    }
}

/// An opaque wrapper blob, used to hold the CMS signature.
#[derive(Clone, Debug, Default)]
pub struct BlobWrapperBlob<'a> {
    data: Cow<'a, [u8]>,
}

impl<'a> BlobWrapperBlob<'a> {
    pub fn from_data(data: &'a [u8]) -> Self {
        Self {
            data: Cow::Borrowed(data),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl<'a> Blob<'a> for BlobWrapperBlob<'a> {
    fn magic() -> u32 {
        magic::BLOB_WRAPPER
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self> {
        let payload = read_and_validate_blob_header(data, Self::magic())?;

        Ok(Self {
            data: Cow::Borrowed(payload),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>> {
        Ok(self.data.to_vec())
    }
}

/// A reference to a blob within a parsed superblob.
#[derive(Clone)]
pub struct BlobEntry<'a> {
    pub slot: Slot,
    pub magic: u32,
    pub offset: usize,
    /// Full blob data, including its header.
    pub data: &'a [u8],
}

impl<'a> Debug for BlobEntry<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobEntry")
            .field("slot", &self.slot)
            .field("magic", &format_args!("{:#x}", self.magic))
            .field("offset", &self.offset)
            .field("length", &self.data.len())
            .finish()
    }
}

impl<'a> BlobEntry<'a> {
    pub fn digest_with(&self, kind: DigestKind) -> Vec<u8> {
        kind.digest_data(self.data)
    }
}

/// A parsed embedded signature superblob.
pub struct EmbeddedSignature<'a> {
    pub length: u32,
    pub count: u32,
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> Debug for EmbeddedSignature<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedSignature")
            .field("length", &self.length)
            .field("count", &self.count)
            .field("blobs", &self.blobs)
            .finish()
    }
}

impl<'a> EmbeddedSignature<'a> {
    pub fn from_bytes(data: &'a [u8]) -> Result<Self> {
        let offset = &mut 0;

        let magic = data.gread_with::<u32>(offset, scroll::BE)?;
        if magic != magic::EMBEDDED_SIGNATURE {
            return Err(Error::SuperblobMalformed);
        }

        let length = data.gread_with::<u32>(offset, scroll::BE)?;
        if length as usize > data.len() {
            return Err(Error::SuperblobMalformed);
        }
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        // Each index entry is 8 bytes; reject counts the header can't hold.
        if 12 + count as usize * 8 > length as usize {
            return Err(Error::SuperblobMalformed);
        }

        let mut blobs = Vec::with_capacity(count as usize);
        let mut seen: HashMap<u32, ()> = HashMap::with_capacity(count as usize);

        for _ in 0..count {
            let slot_raw = data.gread_with::<u32>(offset, scroll::BE)?;
            let blob_offset = data.gread_with::<u32>(offset, scroll::BE)? as usize;

            if seen.insert(slot_raw, ()).is_some() {
                return Err(Error::SuperblobMalformed);
            }
            if blob_offset + 8 > data.len() {
                return Err(Error::SuperblobMalformed);
            }

            let (blob_magic, blob_length, _) = read_blob_header(&data[blob_offset..])?;

            blobs.push(BlobEntry {
                slot: Slot::from(slot_raw),
                magic: blob_magic,
                offset: blob_offset,
                data: &data[blob_offset..blob_offset + blob_length],
            });
        }

        Ok(Self {
            length,
            count,
            blobs,
        })
    }

    pub fn find_slot(&self, slot: Slot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|b| b.slot == slot)
    }

    pub fn code_directory(&self) -> Result<Option<crate::code_directory::CodeDirectoryBlob<'a>>> {
        if let Some(entry) = self.find_slot(Slot::CodeDirectory) {
            Ok(Some(crate::code_directory::CodeDirectoryBlob::from_blob_bytes(entry.data)?))
        } else {
            Ok(None)
        }
    }

    pub fn entitlements(&self) -> Result<Option<EntitlementsBlob<'a>>> {
        if let Some(entry) = self.find_slot(Slot::Entitlements) {
            Ok(Some(EntitlementsBlob::from_blob_bytes(entry.data)?))
        } else {
            Ok(None)
        }
    }

    pub fn requirement_set(&self) -> Result<Option<RequirementSetBlob<'a>>> {
        if let Some(entry) = self.find_slot(Slot::RequirementSet) {
            Ok(Some(RequirementSetBlob::from_blob_bytes(entry.data)?))
        } else {
            Ok(None)
        }
    }

    /// Raw CMS data from the signature slot, if present.
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>> {
        if let Some(entry) = self.find_slot(Slot::Signature) {
            Ok(Some(read_and_validate_blob_header(
                entry.data,
                magic::BLOB_WRAPPER,
            )?))
        } else {
            Ok(None)
        }
    }
}
