// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synthetic Mach-O binaries for tests.
//!
//! These are hand-assembled 64-bit little-endian images with a __TEXT
//! segment (one section), a __LINKEDIT segment, a symbol table, and a
//! configurable set of dylib load commands. `header_pad` controls how much
//! free space separates the load command table from the first section, so
//! tests can force the relayout path by making it tight.

use crate::macho::*;

struct Cmds {
    buf: Vec<u8>,
}

impl Cmds {
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn name16(&mut self, name: &str) {
        let mut raw = [0u8; 16];
        raw[0..name.len()].copy_from_slice(name.as_bytes());
        self.buf.extend_from_slice(&raw);
    }
}

pub fn dylib_command_size(path: &str) -> usize {
    align_to(24 + path.len() + 1, 8)
}

/// Build a thin arm64 executable with the given (path, weak) dylib commands.
pub fn thin_macho_ex(dylibs: &[(&str, bool)], header_pad: usize, cputype: u32) -> Vec<u8> {
    let sect_size = 0x100usize;
    let linkedit_size = 0x40usize;

    let dylib_cmds_size: usize = dylibs.iter().map(|(p, _)| dylib_command_size(p)).sum();
    // segment64 + section64, segment64, symtab, dylibs
    let sizeofcmds = (72 + 80) + 72 + 24 + dylib_cmds_size;
    let ncmds = 3 + dylibs.len();

    let sect_off = 32 + sizeofcmds + header_pad;
    let text_size = sect_off + sect_size;
    let linkedit_off = align_to(text_size, 16);
    let total = linkedit_off + linkedit_size;

    let mut c = Cmds { buf: Vec::new() };

    // mach_header_64
    c.u32(MH_MAGIC_64);
    c.u32(cputype);
    c.u32(0);
    c.u32(MH_EXECUTE);
    c.u32(ncmds as u32);
    c.u32(sizeofcmds as u32);
    c.u32(0);
    c.u32(0);

    // __TEXT segment with one section
    c.u32(LC_SEGMENT_64);
    c.u32(72 + 80);
    c.name16(SEG_TEXT);
    c.u64(0x1_0000_0000);
    c.u64(0x4000);
    c.u64(0);
    c.u64(text_size as u64);
    c.u32(5);
    c.u32(5);
    c.u32(1);
    c.u32(0);

    c.name16("__text");
    c.name16(SEG_TEXT);
    c.u64(0x1_0000_0000 + sect_off as u64);
    c.u64(sect_size as u64);
    c.u32(sect_off as u32);
    c.u32(2);
    c.u32(0); // reloff
    c.u32(0); // nreloc
    c.u32(0x80000400);
    c.u32(0);
    c.u32(0);
    c.u32(0);

    // __LINKEDIT segment
    c.u32(LC_SEGMENT_64);
    c.u32(72);
    c.name16(SEG_LINKEDIT);
    c.u64(0x1_0000_4000);
    c.u64(0x4000);
    c.u64(linkedit_off as u64);
    c.u64(linkedit_size as u64);
    c.u32(1);
    c.u32(1);
    c.u32(0);
    c.u32(0);

    // LC_SYMTAB pointing into __LINKEDIT
    c.u32(LC_SYMTAB);
    c.u32(24);
    c.u32(linkedit_off as u32);
    c.u32(0);
    c.u32(linkedit_off as u32 + 0x10);
    c.u32(0x10);

    for (path, weak) in dylibs {
        let cmdsize = dylib_command_size(path);
        c.u32(if *weak { LC_LOAD_WEAK_DYLIB } else { LC_LOAD_DYLIB });
        c.u32(cmdsize as u32);
        c.u32(24); // name offset
        c.u32(2); // timestamp
        c.u32(0x10000); // current version
        c.u32(0x10000); // compatibility version
        let mut name = path.as_bytes().to_vec();
        name.resize(cmdsize - 24, 0);
        c.buf.extend_from_slice(&name);
    }

    assert_eq!(c.buf.len(), 32 + sizeofcmds);

    let mut data = c.buf;
    data.resize(sect_off, 0);
    data.resize(sect_off + sect_size, 0xcc);
    data.resize(linkedit_off, 0);
    data.resize(total, 0xdd);

    data
}

pub fn thin_macho(dylibs: &[&str], header_pad: usize) -> Vec<u8> {
    let dylibs = dylibs.iter().map(|p| (*p, false)).collect::<Vec<_>>();
    thin_macho_ex(&dylibs, header_pad, CPU_TYPE_ARM64)
}

/// A two arch (arm64 + x86_64) universal binary.
pub fn fat_macho() -> Vec<u8> {
    let page = 4096usize;
    let slice0 = thin_macho_ex(
        &[("/usr/lib/libSystem.B.dylib", false)],
        256,
        CPU_TYPE_ARM64,
    );
    let slice1 = thin_macho_ex(
        &[("/usr/lib/libSystem.B.dylib", false)],
        256,
        CPU_TYPE_X86_64,
    );

    let off0 = page;
    let off1 = align_to(off0 + slice0.len(), page);

    let mut data = Vec::new();
    data.extend_from_slice(&FAT_MAGIC.to_be_bytes());
    data.extend_from_slice(&2u32.to_be_bytes());
    for (slice, off, cputype) in [
        (&slice0, off0, CPU_TYPE_ARM64),
        (&slice1, off1, CPU_TYPE_X86_64),
    ] {
        data.extend_from_slice(&cputype.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&(off as u32).to_be_bytes());
        data.extend_from_slice(&(slice.len() as u32).to_be_bytes());
        data.extend_from_slice(&12u32.to_be_bytes());
    }

    data.resize(off0, 0);
    data.extend_from_slice(&slice0);
    data.resize(off1, 0);
    data.extend_from_slice(&slice1);

    data
}
