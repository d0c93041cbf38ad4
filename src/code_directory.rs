// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure.
//!
//! The code directory is the heart of a signature: it records the binary's
//! identity and a hash of every page of signable content, plus hashes of
//! the other blobs in the signature (the *special* slots, addressed as
//! negative indices before the page hash array).

use {
    crate::{
        embedded_signature::{magic, read_and_validate_blob_header, Blob, Digest, DigestKind, Slot},
        error::{Error, Result},
    },
    scroll::{IOwrite, Pread},
    std::{borrow::Cow, collections::BTreeMap, io::Write},
};

bitflags::bitflags! {
    /// Signature status and policy flags.
    #[derive(Default)]
    pub struct CodeSignatureFlags: u32 {
        const HOST = 0x0001;
        const ADHOC = 0x0002;
        const FORCE_HARD = 0x0100;
        const FORCE_KILL = 0x0200;
        const RESTRICT = 0x0800;
        const ENFORCEMENT = 0x1000;
        const LIBRARY_VALIDATION = 0x2000;
        const RUNTIME = 0x10000;
        const LINKER_SIGNED = 0x20000;
    }
}

bitflags::bitflags! {
    /// Flags describing the executable segment.
    #[derive(Default)]
    pub struct ExecutableSegmentFlags: u64 {
        const MAIN_BINARY = 0x0001;
        const ALLOW_UNSIGNED = 0x0010;
        const DEBUGGER = 0x0020;
        const JIT = 0x0040;
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        const CAN_LOAD_CD_HASH = 0x0100;
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

/// Format versions, gating which trailing fields are present.
pub mod version {
    pub const INITIAL: u32 = 0x20000;
    pub const SUPPORTS_SCATTER: u32 = 0x20100;
    pub const SUPPORTS_TEAM_ID: u32 = 0x20200;
    pub const SUPPORTS_CODE_LIMIT_64: u32 = 0x20300;
    pub const SUPPORTS_EXECUTABLE_SEGMENT: u32 = 0x20400;
    pub const SUPPORTS_RUNTIME: u32 = 0x20500;
}

/// A code directory blob.
///
/// Fields gated on versions newer than the one being serialized are
/// silently omitted on write.
#[derive(Clone, Debug)]
pub struct CodeDirectoryBlob<'a> {
    pub version: u32,
    pub flags: CodeSignatureFlags,
    pub code_limit: u32,
    pub digest_type: DigestKind,
    pub platform: u8,
    pub page_size: u32,
    pub spare2: u32,
    pub scatter_offset: Option<u32>,
    pub spare3: Option<u32>,
    pub code_limit_64: Option<u64>,
    pub exec_seg_base: Option<u64>,
    pub exec_seg_limit: Option<u64>,
    pub exec_seg_flags: Option<ExecutableSegmentFlags>,
    pub ident: Cow<'a, str>,
    pub team_name: Option<Cow<'a, str>>,
    pub code_digests: Vec<Digest<'a>>,
    pub(crate) special_digests: BTreeMap<Slot, Digest<'a>>,
}

impl<'a> Default for CodeDirectoryBlob<'a> {
    fn default() -> Self {
        Self {
            version: version::SUPPORTS_EXECUTABLE_SEGMENT,
            flags: CodeSignatureFlags::empty(),
            code_limit: 0,
            digest_type: DigestKind::Sha256,
            platform: 0,
            page_size: 4096,
            spare2: 0,
            scatter_offset: None,
            spare3: None,
            code_limit_64: None,
            exec_seg_base: None,
            exec_seg_limit: None,
            exec_seg_flags: None,
            ident: Cow::Borrowed(""),
            team_name: None,
            code_digests: vec![],
            special_digests: BTreeMap::new(),
        }
    }
}

fn read_cstring(data: &[u8], offset: usize) -> Result<&str> {
    let tail = data.get(offset..).ok_or(Error::SuperblobMalformed)?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::SuperblobMalformed)?;

    std::str::from_utf8(&tail[0..end]).map_err(|_| Error::SuperblobMalformed)
}

impl<'a> Blob<'a> for CodeDirectoryBlob<'a> {
    fn magic() -> u32 {
        magic::CODE_DIRECTORY
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self> {
        read_and_validate_blob_header(data, Self::magic())?;

        let version = data.pread_with::<u32>(8, scroll::BE)?;
        if !(version::SUPPORTS_SCATTER..=version::SUPPORTS_RUNTIME).contains(&version) {
            return Err(Error::SuperblobMalformed);
        }

        let flags = data.pread_with::<u32>(12, scroll::BE)?;
        let hash_offset = data.pread_with::<u32>(16, scroll::BE)? as usize;
        let ident_offset = data.pread_with::<u32>(20, scroll::BE)? as usize;
        let n_special = data.pread_with::<u32>(24, scroll::BE)? as usize;
        let n_code = data.pread_with::<u32>(28, scroll::BE)? as usize;
        let code_limit = data.pread_with::<u32>(32, scroll::BE)?;
        let digest_size = data.pread::<u8>(36)? as usize;
        let digest_type = DigestKind::try_from(data.pread::<u8>(37)?)?;
        let platform = data.pread::<u8>(38)?;
        let page_size_log2 = data.pread::<u8>(39)?;
        let spare2 = data.pread_with::<u32>(40, scroll::BE)?;

        let scatter_offset = Some(data.pread_with::<u32>(44, scroll::BE)?);

        let team_offset = if version >= version::SUPPORTS_TEAM_ID {
            Some(data.pread_with::<u32>(48, scroll::BE)? as usize)
        } else {
            None
        };

        let (spare3, code_limit_64) = if version >= version::SUPPORTS_CODE_LIMIT_64 {
            (
                Some(data.pread_with::<u32>(52, scroll::BE)?),
                Some(data.pread_with::<u64>(56, scroll::BE)?),
            )
        } else {
            (None, None)
        };

        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if version >= version::SUPPORTS_EXECUTABLE_SEGMENT {
                (
                    Some(data.pread_with::<u64>(64, scroll::BE)?),
                    Some(data.pread_with::<u64>(72, scroll::BE)?),
                    Some(ExecutableSegmentFlags::from_bits_truncate(
                        data.pread_with::<u64>(80, scroll::BE)?,
                    )),
                )
            } else {
                (None, None, None)
            };

        let ident = Cow::Borrowed(read_cstring(data, ident_offset)?);
        let team_name = match team_offset {
            Some(offset) if offset != 0 => Some(Cow::Borrowed(read_cstring(data, offset)?)),
            _ => None,
        };

        if digest_size != digest_type.hash_len() {
            return Err(Error::SuperblobMalformed);
        }

        let special_start = hash_offset
            .checked_sub(n_special * digest_size)
            .ok_or(Error::SuperblobMalformed)?;
        let hashes_end = hash_offset + n_code * digest_size;
        if hashes_end > data.len() {
            return Err(Error::SuperblobMalformed);
        }

        // Special digests are stored ascending towards the page hashes, so
        // slot -1 is immediately before hash_offset.
        let mut special_digests = BTreeMap::new();
        for i in 0..n_special {
            let offset = special_start + i * digest_size;
            let digest = &data[offset..offset + digest_size];
            if digest.iter().any(|&b| b != 0) {
                special_digests.insert(
                    Slot::from((n_special - i) as u32),
                    Digest {
                        data: Cow::Borrowed(digest),
                    },
                );
            }
        }

        let code_digests = (0..n_code)
            .map(|i| {
                let offset = hash_offset + i * digest_size;
                Digest {
                    data: Cow::Borrowed(&data[offset..offset + digest_size]),
                }
            })
            .collect();

        Ok(Self {
            version,
            flags: CodeSignatureFlags::from_bits_truncate(flags),
            code_limit,
            digest_type,
            platform,
            page_size: 1u32 << page_size_log2,
            spare2,
            scatter_offset,
            spare3,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            ident,
            team_name,
            code_digests,
            special_digests,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>> {
        let digest_size = self.digest_type.hash_len();

        let n_special = self
            .special_digests
            .keys()
            .filter_map(|slot| slot.special_hash_index())
            .max()
            .unwrap_or(0) as usize;

        // Payload size of the fixed fields, excluding the 8 byte blob
        // header. Version gated fields extend it below.
        let mut fixed_len = 36usize;
        if self.version >= version::SUPPORTS_SCATTER {
            fixed_len += 4;
        }
        if self.version >= version::SUPPORTS_TEAM_ID {
            fixed_len += 4;
        }
        if self.version >= version::SUPPORTS_CODE_LIMIT_64 {
            fixed_len += 12;
        }
        if self.version >= version::SUPPORTS_EXECUTABLE_SEGMENT {
            fixed_len += 24;
        }

        // Offsets are relative to the start of the blob, so account for
        // the 8 byte header this payload doesn't include.
        let ident_offset = 8 + fixed_len;
        let mut team_offset = 0usize;
        let mut strings_end = ident_offset + self.ident.len() + 1;
        if let Some(team) = &self.team_name {
            team_offset = strings_end;
            strings_end += team.len() + 1;
        }
        let hash_offset = strings_end + n_special * digest_size;

        let mut cursor = std::io::Cursor::new(Vec::new());

        cursor.iowrite_with(self.version, scroll::BE)?;
        cursor.iowrite_with(self.flags.bits(), scroll::BE)?;
        cursor.iowrite_with(hash_offset as u32, scroll::BE)?;
        cursor.iowrite_with(ident_offset as u32, scroll::BE)?;
        cursor.iowrite_with(n_special as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_digests.len() as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_limit, scroll::BE)?;
        cursor.iowrite(digest_size as u8)?;
        cursor.iowrite(u8::from(self.digest_type))?;
        cursor.iowrite(self.platform)?;
        cursor.iowrite(self.page_size.trailing_zeros() as u8)?;
        cursor.iowrite_with(self.spare2, scroll::BE)?;

        if self.version >= version::SUPPORTS_SCATTER {
            cursor.iowrite_with(self.scatter_offset.unwrap_or(0), scroll::BE)?;
        }
        if self.version >= version::SUPPORTS_TEAM_ID {
            cursor.iowrite_with(team_offset as u32, scroll::BE)?;
        }
        if self.version >= version::SUPPORTS_CODE_LIMIT_64 {
            cursor.iowrite_with(self.spare3.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;
        }
        if self.version >= version::SUPPORTS_EXECUTABLE_SEGMENT {
            cursor.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(
                self.exec_seg_flags.unwrap_or_default().bits(),
                scroll::BE,
            )?;
        }

        cursor.write_all(self.ident.as_bytes())?;
        cursor.iowrite(0u8)?;
        if let Some(team) = &self.team_name {
            cursor.write_all(team.as_bytes())?;
            cursor.iowrite(0u8)?;
        }

        // Special digests, slot -n_special first, zero filled where absent.
        for index in (1..=n_special as u32).rev() {
            match self.special_digests.get(&Slot::from(index)) {
                Some(digest) if digest.data.len() == digest_size => {
                    cursor.write_all(&digest.data)?;
                }
                Some(_) => return Err(Error::SuperblobMalformed),
                None => cursor.write_all(&vec![0u8; digest_size])?,
            }
        }

        for digest in &self.code_digests {
            if digest.data.len() != digest_size {
                return Err(Error::SuperblobMalformed);
            }
            cursor.write_all(&digest.data)?;
        }

        Ok(cursor.into_inner())
    }
}

impl<'a> CodeDirectoryBlob<'a> {
    pub fn slot_digest(&self, slot: Slot) -> Option<&Digest<'a>> {
        self.special_digests.get(&slot)
    }

    pub fn set_slot_digest(&mut self, slot: Slot, digest: Digest<'a>) -> Result<()> {
        if slot.special_hash_index().is_none() {
            return Err(Error::SuperblobMalformed);
        }
        self.special_digests.insert(slot, digest);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cd() -> CodeDirectoryBlob<'static> {
        let mut cd = CodeDirectoryBlob {
            code_limit: 0x5000,
            flags: CodeSignatureFlags::ADHOC,
            ident: Cow::Borrowed("com.example.demo"),
            team_name: Some(Cow::Borrowed("TEAM123456")),
            exec_seg_base: Some(0),
            exec_seg_limit: Some(0x4000),
            exec_seg_flags: Some(ExecutableSegmentFlags::MAIN_BINARY),
            code_digests: (0..5)
                .map(|i| Digest {
                    data: Cow::Owned(vec![i as u8; 32]),
                })
                .collect(),
            ..Default::default()
        };
        cd.set_slot_digest(
            Slot::RequirementSet,
            Digest {
                data: Cow::Owned(vec![0xaa; 32]),
            },
        )
        .unwrap();

        cd
    }

    #[test]
    fn serialize_parse_round_trip() {
        let cd = sample_cd();
        let blob = cd.to_blob_bytes().unwrap();

        let parsed = CodeDirectoryBlob::from_blob_bytes(&blob).unwrap();
        assert_eq!(parsed.version, version::SUPPORTS_EXECUTABLE_SEGMENT);
        assert_eq!(parsed.flags, CodeSignatureFlags::ADHOC);
        assert_eq!(parsed.code_limit, 0x5000);
        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.ident, "com.example.demo");
        assert_eq!(parsed.team_name.as_deref(), Some("TEAM123456"));
        assert_eq!(parsed.code_digests.len(), 5);
        assert_eq!(parsed.code_digests[3].data.as_ref(), &[3u8; 32][..]);
        assert_eq!(
            parsed.slot_digest(Slot::RequirementSet).unwrap().data.as_ref(),
            &[0xaa; 32][..]
        );
        assert!(parsed.slot_digest(Slot::Info).is_none());
        assert_eq!(
            parsed.exec_seg_flags,
            Some(ExecutableSegmentFlags::MAIN_BINARY)
        );
    }

    #[test]
    fn offset_fields_locate_their_bytes() {
        let cd = sample_cd();
        let blob = cd.to_blob_bytes().unwrap();

        let hash_offset = blob.pread_with::<u32>(16, scroll::BE).unwrap() as usize;
        let ident_offset = blob.pread_with::<u32>(20, scroll::BE).unwrap() as usize;
        let team_offset = blob.pread_with::<u32>(48, scroll::BE).unwrap() as usize;

        // Offsets are blob relative and must land exactly on the content
        // they describe.
        assert_eq!(
            &blob[ident_offset..ident_offset + 17],
            b"com.example.demo\0"
        );
        assert_eq!(&blob[team_offset..team_offset + 11], b"TEAM123456\0");
        assert_eq!(&blob[hash_offset + 32..hash_offset + 64], &[1u8; 32][..]);
        // Slot -2 sits two digests before the page hash array.
        assert_eq!(
            &blob[hash_offset - 64..hash_offset - 32],
            &[0xaa; 32][..]
        );
    }

    #[test]
    fn unassigned_special_slot_survives_round_trip() {
        let mut cd = sample_cd();
        cd.set_slot_digest(
            Slot::from(6),
            Digest {
                data: Cow::Owned(vec![0xbb; 32]),
            },
        )
        .unwrap();

        let blob = cd.to_blob_bytes().unwrap();
        assert_eq!(blob.pread_with::<u32>(24, scroll::BE).unwrap(), 6);

        let parsed = CodeDirectoryBlob::from_blob_bytes(&blob).unwrap();
        assert_eq!(
            parsed.slot_digest(Slot::from(6)).unwrap().data.as_ref(),
            &[0xbb; 32][..]
        );
        assert_eq!(blob, parsed.to_blob_bytes().unwrap());
    }

    #[test]
    fn serialization_is_deterministic() {
        let cd = sample_cd();
        assert_eq!(cd.to_blob_bytes().unwrap(), cd.to_blob_bytes().unwrap());
    }

    #[test]
    fn non_special_slot_digest_rejected() {
        let mut cd = sample_cd();
        assert!(cd
            .set_slot_digest(
                Slot::Signature,
                Digest {
                    data: Cow::Owned(vec![0; 32])
                }
            )
            .is_err());
    }
}
