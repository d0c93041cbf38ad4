// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mach-O container model.
//!
//! A [MachFile] owns the raw bytes of a thin or universal (fat) binary and
//! exposes each architecture as an independently mutable [ArchSlice].
//! Serializing an unmodified file reproduces the input bytes exactly;
//! modified fat containers are reassembled with slice offsets re-derived
//! from each slice's declared alignment.

use crate::error::{Error, Result};

pub const FAT_MAGIC: u32 = 0xcafebabe;
pub const FAT_MAGIC_64: u32 = 0xcafebabf;
pub const MH_MAGIC: u32 = 0xfeedface;
pub const MH_CIGAM: u32 = 0xcefaedfe;
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const MH_CIGAM_64: u32 = 0xcffaedfe;

pub const CPU_TYPE_ARM: u32 = 12;
pub const CPU_TYPE_ARM64: u32 = 0x0100000c;
pub const CPU_TYPE_X86_64: u32 = 0x01000007;

const LC_REQ_DYLD: u32 = 0x80000000;

pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1e;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2b;
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;
pub const LC_LINKER_OPTIMIZATION_HINT: u32 = 0x2e;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

pub const SEG_TEXT: &str = "__TEXT";
pub const SEG_LINKEDIT: &str = "__LINKEDIT";

pub(crate) fn read_u32(data: &[u8], offset: usize, big_endian: bool) -> Result<u32> {
    let bytes: [u8; 4] = data
        .get(offset..offset + 4)
        .ok_or(Error::TruncatedData("u32 read out of bounds"))?
        .try_into()
        .unwrap();

    Ok(if big_endian {
        u32::from_be_bytes(bytes)
    } else {
        u32::from_le_bytes(bytes)
    })
}

pub(crate) fn read_u64(data: &[u8], offset: usize, big_endian: bool) -> Result<u64> {
    let bytes: [u8; 8] = data
        .get(offset..offset + 8)
        .ok_or(Error::TruncatedData("u64 read out of bounds"))?
        .try_into()
        .unwrap();

    Ok(if big_endian {
        u64::from_be_bytes(bytes)
    } else {
        u64::from_le_bytes(bytes)
    })
}

pub(crate) fn write_u32(data: &mut [u8], offset: usize, value: u32, big_endian: bool) -> Result<()> {
    let dest = data
        .get_mut(offset..offset + 4)
        .ok_or(Error::TruncatedData("u32 write out of bounds"))?;
    dest.copy_from_slice(&if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    });

    Ok(())
}

pub(crate) fn write_u64(data: &mut [u8], offset: usize, value: u64, big_endian: bool) -> Result<()> {
    let dest = data
        .get_mut(offset..offset + 8)
        .ok_or(Error::TruncatedData("u64 write out of bounds"))?;
    dest.copy_from_slice(&if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    });

    Ok(())
}

pub(crate) fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

fn segment_name(data: &[u8], offset: usize) -> Result<String> {
    let raw = data
        .get(offset..offset + 16)
        .ok_or(Error::TruncatedData("segment name out of bounds"))?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(16);

    Ok(String::from_utf8_lossy(&raw[0..end]).into_owned())
}

/// A raw load command: kind plus its location in the slice.
#[derive(Clone, Copy, Debug)]
pub struct RawCommand {
    pub cmd: u32,
    pub offset: usize,
    pub size: usize,
}

/// A segment command's interesting fields.
#[derive(Clone, Debug)]
pub struct SegmentInfo {
    pub name: String,
    pub cmd_offset: usize,
    pub is_64: bool,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub nsects: u32,
    pub sections_offset: usize,
}

impl SegmentInfo {
    pub fn section_entry_size(&self) -> usize {
        if self.is_64 {
            80
        } else {
            68
        }
    }
}

/// Derived view over one slice's load commands.
///
/// Offsets are relative to the start of the slice, not the container.
#[derive(Clone, Debug)]
pub struct SliceView {
    pub is_64: bool,
    pub big_endian: bool,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub header_size: usize,
    pub commands: Vec<RawCommand>,
    pub segments: Vec<SegmentInfo>,
    /// (dataoff, datasize, command offset) of LC_CODE_SIGNATURE if present.
    pub signature: Option<(u32, u32, usize)>,
    /// Lowest file offset of referenced content after the header region.
    pub first_content_offset: usize,
}

/// Executable file type. Dylibs and bundles use other values.
pub const MH_EXECUTE: u32 = 0x2;

impl SliceView {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let magic = read_u32(data, 0, false)?;
        let (is_64, big_endian) = match magic {
            MH_MAGIC => (false, false),
            MH_MAGIC_64 => (true, false),
            MH_CIGAM => (false, true),
            MH_CIGAM_64 => (true, true),
            _ => return Err(Error::MalformedContainer("unrecognized Mach-O magic")),
        };

        let header_size: usize = if is_64 { 32 } else { 28 };
        let filetype = read_u32(data, 12, big_endian)?;
        let ncmds = read_u32(data, 16, big_endian)?;
        let sizeofcmds = read_u32(data, 20, big_endian)?;

        let table_end = header_size
            .checked_add(sizeofcmds as usize)
            .ok_or(Error::OffsetOverflow("load command table size"))?;
        if table_end > data.len() {
            return Err(Error::TruncatedData("load commands extend beyond file"));
        }

        let mut commands = Vec::with_capacity(ncmds as usize);
        let mut segments = Vec::new();
        let mut signature = None;
        let mut first_content_offset = data.len();

        let mut offset = header_size;
        for _ in 0..ncmds {
            let cmd = read_u32(data, offset, big_endian)?;
            let size = read_u32(data, offset + 4, big_endian)? as usize;

            if size < 8 || offset + size > table_end {
                return Err(Error::MalformedContainer("load command size out of range"));
            }

            match cmd {
                LC_SEGMENT | LC_SEGMENT_64 => {
                    let seg_64 = cmd == LC_SEGMENT_64;
                    let seg = if seg_64 {
                        SegmentInfo {
                            name: segment_name(data, offset + 8)?,
                            cmd_offset: offset,
                            is_64: true,
                            vmaddr: read_u64(data, offset + 24, big_endian)?,
                            vmsize: read_u64(data, offset + 32, big_endian)?,
                            fileoff: read_u64(data, offset + 40, big_endian)?,
                            filesize: read_u64(data, offset + 48, big_endian)?,
                            nsects: read_u32(data, offset + 64, big_endian)?,
                            sections_offset: offset + 72,
                        }
                    } else {
                        SegmentInfo {
                            name: segment_name(data, offset + 8)?,
                            cmd_offset: offset,
                            is_64: false,
                            vmaddr: read_u32(data, offset + 24, big_endian)? as u64,
                            vmsize: read_u32(data, offset + 28, big_endian)? as u64,
                            fileoff: read_u32(data, offset + 32, big_endian)? as u64,
                            filesize: read_u32(data, offset + 36, big_endian)? as u64,
                            nsects: read_u32(data, offset + 48, big_endian)?,
                            sections_offset: offset + 56,
                        }
                    };

                    if seg.fileoff > 0 && seg.filesize > 0 {
                        first_content_offset = first_content_offset.min(seg.fileoff as usize);
                    }

                    let entry_size = seg.section_entry_size();
                    let offset_field = if seg_64 { 48 } else { 40 };
                    for i in 0..seg.nsects as usize {
                        let sect = seg.sections_offset + i * entry_size;
                        let file_offset = read_u32(data, sect + offset_field, big_endian)?;
                        if file_offset > 0 {
                            first_content_offset =
                                first_content_offset.min(file_offset as usize);
                        }
                    }

                    segments.push(seg);
                }
                LC_CODE_SIGNATURE => {
                    let dataoff = read_u32(data, offset + 8, big_endian)?;
                    let datasize = read_u32(data, offset + 12, big_endian)?;
                    signature = Some((dataoff, datasize, offset));
                }
                _ => {}
            }

            commands.push(RawCommand { cmd, offset, size });
            offset += size;
        }

        Ok(Self {
            is_64,
            big_endian,
            filetype,
            ncmds,
            sizeofcmds,
            header_size,
            commands,
            segments,
            signature,
            first_content_offset,
        })
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn load_commands_end(&self) -> usize {
        self.header_size + self.sizeofcmds as usize
    }

    /// End of signable content. For a signed slice this is where the
    /// embedded signature begins; otherwise the end of segment data.
    pub fn code_limit(&self) -> usize {
        if let Some((dataoff, _, _)) = self.signature {
            dataoff as usize
        } else {
            self.segments
                .iter()
                .map(|s| (s.fileoff + s.filesize) as usize)
                .max()
                .unwrap_or(0)
        }
    }

    pub fn is_executable(&self) -> bool {
        self.filetype == MH_EXECUTE
    }

    /// Verify the slice has the layout signing requires.
    pub fn check_signable(&self, data: &[u8]) -> Result<()> {
        let linkedit = self
            .segment(SEG_LINKEDIT)
            .ok_or(Error::MalformedContainer("no __LINKEDIT segment"))?;

        let linkedit_end = (linkedit.fileoff + linkedit.filesize) as usize;
        if linkedit_end < data.len() {
            return Err(Error::MalformedContainer(
                "__LINKEDIT is not the final content in the binary",
            ));
        }
        if self
            .segments
            .iter()
            .any(|s| s.fileoff > linkedit.fileoff)
        {
            return Err(Error::MalformedContainer(
                "__LINKEDIT is not the final segment",
            ));
        }
        if let Some((dataoff, datasize, _)) = self.signature {
            if (dataoff as usize).saturating_add(datasize as usize) < data.len() {
                return Err(Error::MalformedContainer(
                    "file data exists after the embedded signature",
                ));
            }
        }

        Ok(())
    }
}

/// One architecture within a container.
#[derive(Clone, Debug)]
pub struct ArchSlice {
    pub cputype: u32,
    pub cpusubtype: u32,
    /// Alignment of the slice within a fat container, as a power of two.
    pub align: u32,
    pub data: Vec<u8>,
    modified: bool,
}

impl ArchSlice {
    pub fn view(&self) -> Result<SliceView> {
        SliceView::parse(&self.data)
    }

    /// Parse with goblin, for segment/symbol level introspection.
    pub fn parsed(&self) -> Result<goblin::mach::MachO<'_>> {
        Ok(goblin::mach::MachO::parse(&self.data, 0)?)
    }

    pub fn arch_name(&self) -> &'static str {
        match self.cputype {
            CPU_TYPE_ARM => "arm",
            CPU_TYPE_ARM64 => "arm64",
            CPU_TYPE_X86_64 => "x86_64",
            _ => "unknown",
        }
    }

    pub fn is_signable_arch(&self) -> bool {
        matches!(
            self.cputype,
            CPU_TYPE_ARM | CPU_TYPE_ARM64 | CPU_TYPE_X86_64
        )
    }

    /// Replace the slice's bytes, marking it dirty for fat reassembly.
    pub fn replace_data(&mut self, data: Vec<u8>) {
        self.data = data;
        self.modified = true;
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

/// A thin or universal Mach-O file.
pub struct MachFile {
    original: Vec<u8>,
    is_fat: bool,
    slices: Vec<ArchSlice>,
}

impl MachFile {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::TruncatedData("file too small for a magic"));
        }

        let magic_be = read_u32(&data, 0, true)?;

        let slices = if magic_be == FAT_MAGIC {
            Self::parse_fat(&data)?
        } else if magic_be == FAT_MAGIC_64 {
            return Err(Error::MalformedContainer(
                "64-bit fat containers are not supported",
            ));
        } else {
            let magic = read_u32(&data, 0, false)?;
            if !matches!(magic, MH_MAGIC | MH_MAGIC_64 | MH_CIGAM | MH_CIGAM_64) {
                return Err(Error::MalformedContainer("unrecognized file magic"));
            }

            let view = SliceView::parse(&data)?;
            let big_endian = view.big_endian;

            vec![ArchSlice {
                cputype: read_u32(&data, 4, big_endian)?,
                cpusubtype: read_u32(&data, 8, big_endian)?,
                align: 0,
                data: data.clone(),
                modified: false,
            }]
        };

        if !slices.iter().any(|s| s.is_signable_arch()) {
            return Err(Error::UnsupportedArchitecture);
        }

        // Each slice must be a structurally valid Mach-O.
        for slice in &slices {
            slice.parsed()?;
        }

        Ok(Self {
            original: data,
            is_fat: magic_be == FAT_MAGIC,
            slices,
        })
    }

    fn parse_fat(data: &[u8]) -> Result<Vec<ArchSlice>> {
        let nfat = read_u32(data, 4, true)? as usize;
        if nfat == 0 {
            return Err(Error::MalformedContainer("fat container has no slices"));
        }

        let table_end = 8 + nfat * 20;
        let mut ranges: Vec<(usize, usize)> = Vec::with_capacity(nfat);
        let mut slices = Vec::with_capacity(nfat);

        for i in 0..nfat {
            let entry = 8 + i * 20;
            let cputype = read_u32(data, entry, true)?;
            let cpusubtype = read_u32(data, entry + 4, true)?;
            let offset = read_u32(data, entry + 8, true)? as usize;
            let size = read_u32(data, entry + 12, true)? as usize;
            let align = read_u32(data, entry + 16, true)?;

            let end = offset
                .checked_add(size)
                .ok_or(Error::OffsetOverflow("fat arch extent"))?;
            if end > data.len() {
                return Err(Error::TruncatedData("fat arch extends beyond file"));
            }
            if offset < table_end {
                return Err(Error::MalformedContainer("fat arch overlaps header"));
            }
            if align >= 32 || offset % (1usize << align) != 0 {
                return Err(Error::MalformedContainer(
                    "fat arch violates its declared alignment",
                ));
            }
            if ranges.iter().any(|&(s, e)| offset < e && s < end) {
                return Err(Error::MalformedContainer("fat arch slices overlap"));
            }
            ranges.push((offset, end));

            slices.push(ArchSlice {
                cputype,
                cpusubtype,
                align,
                data: data[offset..end].to_vec(),
                modified: false,
            });
        }

        Ok(slices)
    }

    pub fn is_fat(&self) -> bool {
        self.is_fat
    }

    pub fn slices(&self) -> &[ArchSlice] {
        &self.slices
    }

    pub fn slices_mut(&mut self) -> &mut [ArchSlice] {
        &mut self.slices
    }

    pub fn is_modified(&self) -> bool {
        self.slices.iter().any(|s| s.is_modified())
    }

    /// Whether any slice carries an LC_CODE_SIGNATURE command.
    pub fn is_signed(&self) -> Result<bool> {
        for slice in &self.slices {
            if slice.view()?.signature.is_some() {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Serialize back to container bytes.
    ///
    /// Unmodified files round trip exactly. Rebuilt fat containers place
    /// each slice at the next offset satisfying its alignment.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if !self.is_fat {
            return Ok(self.slices[0].data.clone());
        }
        if !self.is_modified() {
            return Ok(self.original.clone());
        }

        let mut header = Vec::with_capacity(8 + self.slices.len() * 20);
        let mut payload_offset = 8 + self.slices.len() * 20;

        header.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        header.extend_from_slice(&(self.slices.len() as u32).to_be_bytes());

        let mut payloads: Vec<(usize, &[u8])> = Vec::with_capacity(self.slices.len());

        for slice in &self.slices {
            let alignment = 1usize << slice.align.max(1);
            let offset = align_to(payload_offset, alignment);

            header.extend_from_slice(&slice.cputype.to_be_bytes());
            header.extend_from_slice(&slice.cpusubtype.to_be_bytes());
            header.extend_from_slice(&u32::try_from(offset).map_err(|_| {
                Error::OffsetOverflow("fat slice offset")
            })?.to_be_bytes());
            header.extend_from_slice(&(slice.data.len() as u32).to_be_bytes());
            header.extend_from_slice(&slice.align.to_be_bytes());

            payloads.push((offset, &slice.data));
            payload_offset = offset + slice.data.len();
        }

        let mut out = vec![0u8; payload_offset];
        out[0..header.len()].copy_from_slice(&header);
        for (offset, data) in payloads {
            out[offset..offset + data.len()].copy_from_slice(data);
        }

        Ok(out)
    }
}
