// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Editing dylib references in load commands.
//!
//! All edits operate on a scratch copy of the slice and commit whole, so a
//! failed edit never leaves a half-mutated binary. Injection that doesn't
//! fit in the header gap triggers a relayout that shifts all file content
//! by one page and patches every file offset field in one pass.

use {
    crate::{
        error::{Error, Result},
        macho::*,
    },
    log::{debug, info, warn},
};

/// How far content moves when the load command table needs to grow.
const RELAYOUT_SHIFT: usize = 0x1000;

const DYLIB_COMMANDS: &[u32] = &[
    LC_LOAD_DYLIB,
    LC_LOAD_WEAK_DYLIB,
    LC_REEXPORT_DYLIB,
    LC_LOAD_UPWARD_DYLIB,
    LC_LAZY_LOAD_DYLIB,
];

/// A dylib reference found in a binary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DylibRef {
    pub path: String,
    pub weak: bool,
    pub cmd: u32,
}

fn dylib_path(data: &[u8], cmd: &RawCommand, big_endian: bool) -> Result<String> {
    let name_offset = read_u32(data, cmd.offset + 8, big_endian)? as usize;
    if name_offset < 24 || name_offset >= cmd.size {
        return Err(Error::MalformedContainer("dylib name offset out of range"));
    }

    let raw = &data[cmd.offset + name_offset..cmd.offset + cmd.size];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());

    Ok(String::from_utf8_lossy(&raw[0..end]).into_owned())
}

/// List dylib references in one slice. LC_ID_DYLIB is not a reference and
/// is excluded.
pub fn list_slice_dylibs(slice: &ArchSlice) -> Result<Vec<DylibRef>> {
    let view = slice.view()?;

    view.commands
        .iter()
        .filter(|c| DYLIB_COMMANDS.contains(&c.cmd))
        .map(|c| {
            Ok(DylibRef {
                path: dylib_path(&slice.data, c, view.big_endian)?,
                weak: c.cmd == LC_LOAD_WEAK_DYLIB,
                cmd: c.cmd,
            })
        })
        .collect()
}

/// List dylib references across all slices, deduplicated in first-seen order.
pub fn list_dylibs(file: &MachFile) -> Result<Vec<DylibRef>> {
    let mut seen = Vec::<DylibRef>::new();

    for slice in file.slices() {
        for entry in list_slice_dylibs(slice)? {
            if !seen.iter().any(|e| e.path == entry.path) {
                seen.push(entry);
            }
        }
    }

    Ok(seen)
}

fn command_size_for_path(path: &str, is_64: bool) -> usize {
    let align = if is_64 { 8 } else { 4 };
    align_to(24 + path.len() + 1, align)
}

/// Shift all file content starting at the first referenced offset, patching
/// every file offset field that points at or past the split point.
pub(crate) fn relayout(data: &[u8], view: &SliceView) -> Result<Vec<u8>> {
    let split = view.first_content_offset;
    let shift = RELAYOUT_SHIFT;
    let be = view.big_endian;

    debug!(
        "relayout: shifting content at {:#x} by {:#x} bytes",
        split, shift
    );

    let mut out = Vec::with_capacity(data.len() + shift);
    out.extend_from_slice(&data[0..split]);
    out.resize(split + shift, 0);
    out.extend_from_slice(&data[split..]);

    let patch32 = |out: &mut Vec<u8>, offset: usize| -> Result<()> {
        let value = read_u32(out, offset, be)? as usize;
        if value != 0 && value >= split {
            let new = value
                .checked_add(shift)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or(Error::OffsetOverflow("relayout"))?;
            write_u32(out, offset, new, be)?;
        }
        Ok(())
    };

    let patch64 = |out: &mut Vec<u8>, offset: usize| -> Result<()> {
        let value = read_u64(out, offset, be)?;
        if value != 0 && value >= split as u64 {
            let new = value
                .checked_add(shift as u64)
                .ok_or(Error::OffsetOverflow("relayout"))?;
            write_u64(out, offset, new, be)?;
        }
        Ok(())
    };

    for cmd in &view.commands {
        match cmd.cmd {
            LC_SEGMENT_64 => {
                let fileoff = read_u64(&out, cmd.offset + 40, be)?;
                let filesize = read_u64(&out, cmd.offset + 48, be)?;

                if fileoff != 0 && fileoff >= split as u64 {
                    patch64(&mut out, cmd.offset + 40)?;
                } else if fileoff + filesize >= split as u64 && filesize > 0 {
                    // Segment spans the split: grow it to keep the moved
                    // content mapped.
                    write_u64(&mut out, cmd.offset + 48, filesize + shift as u64, be)?;
                    let vmsize = read_u64(&out, cmd.offset + 32, be)?;
                    write_u64(&mut out, cmd.offset + 32, vmsize + shift as u64, be)?;
                }

                let nsects = read_u32(&out, cmd.offset + 64, be)? as usize;
                for i in 0..nsects {
                    let sect = cmd.offset + 72 + i * 80;
                    patch32(&mut out, sect + 48)?; // offset
                    patch32(&mut out, sect + 56)?; // reloff
                }
            }
            LC_SEGMENT => {
                let fileoff = read_u32(&out, cmd.offset + 32, be)? as u64;
                let filesize = read_u32(&out, cmd.offset + 36, be)? as u64;

                if fileoff != 0 && fileoff >= split as u64 {
                    patch32(&mut out, cmd.offset + 32)?;
                } else if fileoff + filesize >= split as u64 && filesize > 0 {
                    patch32_add(&mut out, cmd.offset + 36, shift, be)?;
                    patch32_add(&mut out, cmd.offset + 28, shift, be)?;
                }

                let nsects = read_u32(&out, cmd.offset + 48, be)? as usize;
                for i in 0..nsects {
                    let sect = cmd.offset + 56 + i * 68;
                    patch32(&mut out, sect + 40)?; // offset
                    patch32(&mut out, sect + 48)?; // reloff
                }
            }
            LC_SYMTAB => {
                patch32(&mut out, cmd.offset + 8)?; // symoff
                patch32(&mut out, cmd.offset + 16)?; // stroff
            }
            LC_DYSYMTAB => {
                for field in [32, 40, 48, 56, 64, 72] {
                    patch32(&mut out, cmd.offset + field)?;
                }
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                for field in [8, 16, 24, 32, 40] {
                    patch32(&mut out, cmd.offset + field)?;
                }
            }
            LC_CODE_SIGNATURE
            | LC_SEGMENT_SPLIT_INFO
            | LC_FUNCTION_STARTS
            | LC_DATA_IN_CODE
            | LC_DYLIB_CODE_SIGN_DRS
            | LC_LINKER_OPTIMIZATION_HINT
            | LC_DYLD_EXPORTS_TRIE
            | LC_DYLD_CHAINED_FIXUPS => {
                patch32(&mut out, cmd.offset + 8)?; // dataoff
            }
            LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64 => {
                patch32(&mut out, cmd.offset + 8)?; // cryptoff
            }
            _ => {}
        }
    }

    Ok(out)
}

fn patch32_add(out: &mut [u8], offset: usize, shift: usize, be: bool) -> Result<()> {
    let value = read_u32(out, offset, be)? as usize;
    let new = value
        .checked_add(shift)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or(Error::OffsetOverflow("relayout"))?;
    write_u32(out, offset, new, be)
}

/// Append a dylib command of the given kind, relaying out if needed.
fn append_dylib_command(slice_data: &[u8], cmd_kind: u32, path: &str) -> Result<Vec<u8>> {
    let mut view = SliceView::parse(slice_data)?;
    let cmdsize = command_size_for_path(path, view.is_64);

    let mut data = if view.load_commands_end() + cmdsize > view.first_content_offset {
        info!(
            "load command table is full ({} byte gap); relaying out",
            view.first_content_offset - view.load_commands_end()
        );
        let out = relayout(slice_data, &view)?;
        view = SliceView::parse(&out)?;
        if view.load_commands_end() + cmdsize > view.first_content_offset {
            return Err(Error::MalformedContainer(
                "no room for load command after relayout",
            ));
        }
        out
    } else {
        slice_data.to_vec()
    };

    let be = view.big_endian;
    let offset = view.load_commands_end();

    // The gap may hold padding; clear it before writing the command.
    data[offset..offset + cmdsize].fill(0);
    write_u32(&mut data, offset, cmd_kind, be)?;
    write_u32(&mut data, offset + 4, cmdsize as u32, be)?;
    write_u32(&mut data, offset + 8, 24, be)?; // name offset
    write_u32(&mut data, offset + 12, 2, be)?; // timestamp
    write_u32(&mut data, offset + 16, 0x10000, be)?; // current version
    write_u32(&mut data, offset + 20, 0x10000, be)?; // compatibility version
    data[offset + 24..offset + 24 + path.len()].copy_from_slice(path.as_bytes());

    write_u32(&mut data, 16, view.ncmds + 1, be)?;
    write_u32(&mut data, 20, view.sizeofcmds + cmdsize as u32, be)?;

    Ok(data)
}

/// Inject a dylib load command into one slice. Returns false if the path is
/// already referenced.
pub fn inject_slice_dylib(slice: &mut ArchSlice, path: &str, weak: bool) -> Result<bool> {
    if list_slice_dylibs(slice)?.iter().any(|e| e.path == path) {
        debug!("{} already references {}", slice.arch_name(), path);
        return Ok(false);
    }

    let cmd_kind = if weak { LC_LOAD_WEAK_DYLIB } else { LC_LOAD_DYLIB };
    let data = append_dylib_command(&slice.data, cmd_kind, path)?;
    slice.replace_data(data);

    info!("injected {} into {} slice", path, slice.arch_name());

    Ok(true)
}

/// Remove dylib commands matching the given paths from one slice.
/// Returns the number of commands removed.
pub fn uninstall_slice_dylibs(slice: &mut ArchSlice, paths: &[String]) -> Result<usize> {
    let view = slice.view()?;
    let be = view.big_endian;

    let mut removed = 0usize;
    let mut kept: Vec<RawCommand> = Vec::with_capacity(view.commands.len());

    for cmd in &view.commands {
        let matches = DYLIB_COMMANDS.contains(&cmd.cmd)
            && paths.contains(&dylib_path(&slice.data, cmd, be)?);
        if matches {
            removed += 1;
        } else {
            kept.push(*cmd);
        }
    }

    if removed == 0 {
        return Ok(0);
    }

    let mut data = slice.data.clone();
    let old_end = view.load_commands_end();

    let mut write_at = view.header_size;
    for cmd in &kept {
        let bytes = slice.data[cmd.offset..cmd.offset + cmd.size].to_vec();
        data[write_at..write_at + cmd.size].copy_from_slice(&bytes);
        write_at += cmd.size;
    }
    data[write_at..old_end].fill(0);

    write_u32(&mut data, 16, kept.len() as u32, be)?;
    write_u32(&mut data, 20, (write_at - view.header_size) as u32, be)?;

    slice.replace_data(data);

    info!("removed {} dylib command(s) from {} slice", removed, slice.arch_name());

    Ok(removed)
}

/// Rewrite a dylib reference's path in one slice. Returns false if the old
/// path is not referenced.
pub fn change_slice_dylib_path(slice: &mut ArchSlice, old: &str, new: &str) -> Result<bool> {
    let view = slice.view()?;
    let be = view.big_endian;

    let target = view
        .commands
        .iter()
        .filter(|c| DYLIB_COMMANDS.contains(&c.cmd))
        .find(|c| matches!(dylib_path(&slice.data, c, be), Ok(p) if p == old))
        .copied();

    let cmd = match target {
        Some(cmd) => cmd,
        None => return Ok(false),
    };

    let name_offset = read_u32(&slice.data, cmd.offset + 8, be)? as usize;

    if name_offset + new.len() + 1 <= cmd.size {
        let mut data = slice.data.clone();
        data[cmd.offset + name_offset..cmd.offset + cmd.size].fill(0);
        data[cmd.offset + name_offset..cmd.offset + name_offset + new.len()]
            .copy_from_slice(new.as_bytes());
        slice.replace_data(data);
    } else {
        // Too long to patch in place: drop the old command and append a
        // new one of the same kind.
        let kind = cmd.cmd;
        uninstall_slice_dylibs(slice, &[old.to_string()])?;
        let data = append_dylib_command(&slice.data, kind, new)?;
        slice.replace_data(data);
    }

    info!("changed dylib path {} -> {} in {} slice", old, new, slice.arch_name());

    Ok(true)
}

/// Inject a dylib into every slice of a container.
pub fn inject_dylib(file: &mut MachFile, path: &str, weak: bool) -> Result<bool> {
    let mut changed = false;
    for slice in file.slices_mut() {
        changed |= inject_slice_dylib(slice, path, weak)?;
    }

    Ok(changed)
}

/// Remove dylib references from every slice of a container.
pub fn uninstall_dylibs(file: &mut MachFile, paths: &[String]) -> Result<usize> {
    let mut removed = 0;
    for slice in file.slices_mut() {
        removed += uninstall_slice_dylibs(slice, paths)?;
    }

    Ok(removed)
}

/// Rewrite a dylib path in every slice of a container.
pub fn change_dylib_path(file: &mut MachFile, old: &str, new: &str) -> Result<bool> {
    let mut changed = false;
    for slice in file.slices_mut() {
        if change_slice_dylib_path(slice, old, new)? {
            changed = true;
        } else {
            warn!("{} slice does not reference {}", slice.arch_name(), old);
        }
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::fixtures};

    fn parse_slice(dylibs: &[&str], pad: usize) -> MachFile {
        MachFile::parse(fixtures::thin_macho(dylibs, pad)).unwrap()
    }

    const SYSTEM: &str = "/usr/lib/libSystem.B.dylib";

    #[test]
    fn list_reports_existing_references() {
        let file = parse_slice(&[SYSTEM, "/usr/lib/libc++.1.dylib"], 256);
        let libs = list_dylibs(&file).unwrap();
        assert_eq!(
            libs.iter().map(|l| l.path.as_str()).collect::<Vec<_>>(),
            vec![SYSTEM, "/usr/lib/libc++.1.dylib"]
        );
        assert!(libs.iter().all(|l| !l.weak));
    }

    #[test]
    fn inject_appends_reference() {
        let mut file = parse_slice(&[SYSTEM], 256);
        assert!(inject_dylib(&mut file, "@executable_path/libhook.dylib", false).unwrap());

        let libs = list_dylibs(&file).unwrap();
        assert_eq!(libs.len(), 2);
        assert_eq!(libs[1].path, "@executable_path/libhook.dylib");

        // Still a valid container.
        MachFile::parse(file.serialize().unwrap()).unwrap();
    }

    #[test]
    fn inject_is_idempotent() {
        let mut file = parse_slice(&[SYSTEM], 256);
        assert!(inject_dylib(&mut file, "@rpath/libx.dylib", false).unwrap());
        let once = file.serialize().unwrap();
        assert!(!inject_dylib(&mut file, "@rpath/libx.dylib", false).unwrap());
        assert_eq!(file.serialize().unwrap(), once);
    }

    #[test]
    fn weak_injection_uses_weak_command() {
        let mut file = parse_slice(&[SYSTEM], 256);
        inject_dylib(&mut file, "@rpath/libweak.dylib", true).unwrap();

        let libs = list_dylibs(&file).unwrap();
        let entry = libs.iter().find(|l| l.path == "@rpath/libweak.dylib").unwrap();
        assert!(entry.weak);
        assert_eq!(entry.cmd, LC_LOAD_WEAK_DYLIB);
    }

    #[test]
    fn uninstall_reverses_inject() {
        let mut file = parse_slice(&[SYSTEM], 256);
        let before = file.serialize().unwrap();

        inject_dylib(&mut file, "@rpath/libx.dylib", false).unwrap();
        assert_ne!(file.serialize().unwrap(), before);

        let removed = uninstall_dylibs(&mut file, &["@rpath/libx.dylib".to_string()]).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(file.serialize().unwrap(), before);
    }

    #[test]
    fn three_plus_one_references() {
        let mut file = parse_slice(
            &[SYSTEM, "/usr/lib/libc++.1.dylib", "/usr/lib/libobjc.A.dylib"],
            256,
        );
        inject_dylib(&mut file, "@executable_path/Dylibs/libsubstrate.dylib", false).unwrap();

        let libs = list_dylibs(&file).unwrap();
        assert_eq!(libs.len(), 4);
        assert_eq!(libs[3].path, "@executable_path/Dylibs/libsubstrate.dylib");
    }

    #[test]
    fn change_path_in_place_when_it_fits() {
        let mut file = parse_slice(&["/usr/lib/libold_name.dylib"], 256);
        assert!(change_dylib_path(&mut file, "/usr/lib/libold_name.dylib", "/usr/lib/libx.dylib")
            .unwrap());

        let view = file.slices()[0].view().unwrap();
        let libs = list_dylibs(&file).unwrap();
        assert_eq!(libs[0].path, "/usr/lib/libx.dylib");
        // In-place edit: command count and table size unchanged.
        assert_eq!(view.ncmds, 4);
    }

    #[test]
    fn change_path_grows_when_longer() {
        let mut file = parse_slice(&["/usr/lib/libshort.dylib"], 256);
        let long = "@executable_path/Frameworks/libvery_long_replacement_name.dylib";
        assert!(change_dylib_path(&mut file, "/usr/lib/libshort.dylib", long).unwrap());

        let libs = list_dylibs(&file).unwrap();
        assert_eq!(libs.len(), 1);
        assert_eq!(libs[0].path, long);
        MachFile::parse(file.serialize().unwrap()).unwrap();
    }

    #[test]
    fn change_path_missing_reference_reports_false() {
        let mut file = parse_slice(&[SYSTEM], 256);
        assert!(!change_dylib_path(&mut file, "/nope.dylib", "/other.dylib").unwrap());
    }

    #[test]
    fn tight_header_triggers_relayout() {
        let mut file = parse_slice(&[SYSTEM], 0);
        let before = file.slices()[0].view().unwrap();

        inject_dylib(&mut file, "@rpath/libhook.dylib", false).unwrap();

        let slice = &file.slices()[0];
        let after = slice.view().unwrap();

        assert_eq!(slice.data.len(), before_len(&before) + RELAYOUT_SHIFT);
        assert_eq!(
            after.first_content_offset,
            before.first_content_offset + RELAYOUT_SHIFT
        );
        assert_eq!(after.ncmds, before.ncmds + 1);

        // Section content moved intact.
        let sect_off = after.first_content_offset;
        assert!(slice.data[sect_off..sect_off + 0x100].iter().all(|&b| b == 0xcc));

        // Linkedit and symtab offsets were patched coherently.
        let linkedit = after.segment(SEG_LINKEDIT).unwrap();
        let old_linkedit = before.segment(SEG_LINKEDIT).unwrap();
        assert_eq!(
            linkedit.fileoff,
            old_linkedit.fileoff + RELAYOUT_SHIFT as u64
        );
        assert_eq!((linkedit.fileoff + linkedit.filesize) as usize, slice.data.len());

        // goblin still accepts the result.
        slice.parsed().unwrap();
    }

    fn before_len(view: &SliceView) -> usize {
        view.segments
            .iter()
            .map(|s| (s.fileoff + s.filesize) as usize)
            .max()
            .unwrap()
    }

    #[test]
    fn fat_edit_applies_to_all_slices() {
        let mut file = MachFile::parse(fixtures::fat_macho()).unwrap();
        inject_dylib(&mut file, "@rpath/libx.dylib", false).unwrap();

        for slice in file.slices() {
            let libs = list_slice_dylibs(slice).unwrap();
            assert!(libs.iter().any(|l| l.path == "@rpath/libx.dylib"));
        }

        MachFile::parse(file.serialize().unwrap()).unwrap();
    }
}
