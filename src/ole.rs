//! Compound File Binary (OLE2) reader. The writer half lives in [`writer`].

mod writer;

pub(crate) use writer::OleWriter;

use crate::{corrupt, validate, CryptoError};

use bytemuck::allocation::pod_collect_to_vec;
use derivative::Derivative;
use packed_struct::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;

// https://github.com/decalage2/olefile/blob/master/olefile/olefile.py#L207
const MAGIC: [u8; 8] = [208, 207, 17, 224, 161, 177, 26, 225];
const ZERO_CLSID: [u8; 16] = [0; 16];
const BYTE_ORDER: u16 = 0xFFFE;

const HEADER_LENGTH: usize = 76;
/// DIFAT entries held in the header sector itself.
const HEADER_DIFAT_ENTRIES: usize = 109;
const DIRENTRY_LENGTH: usize = 128;
const MINI_STREAM_CUTOFF: u32 = 4096;

const DIFSECT: u32 = 0xFFFF_FFFC;
const FATSECT: u32 = 0xFFFF_FFFD;
const ENDOFCHAIN: u32 = 0xFFFF_FFFE;
const FREESECT: u32 = 0xFFFF_FFFF;
const NOSTREAM: u32 = 0xFFFF_FFFF;

const STGTY_EMPTY: u8 = 0;
const STGTY_STORAGE: u8 = 1;
const STGTY_STREAM: u8 = 2;
const STGTY_ROOT: u8 = 5;

const UNKNOWN_SIZE: u64 = 0x7FFF_FFFF;

#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(endian = "lsb", bit_numbering = "msb0")]
pub(crate) struct OleHeader {
    #[packed_field(bytes = "0..=7")]
    magic: [u8; 8],
    #[packed_field(bytes = "8..=23")]
    clsid: [u8; 16],
    #[packed_field(bytes = "24..=25")]
    minor_version: u16,
    #[packed_field(bytes = "26..=27")]
    dll_version: u16,
    #[packed_field(bytes = "28..=29")]
    byte_order: u16,
    #[packed_field(bytes = "30..=31")]
    sector_shift: u16,
    #[packed_field(bytes = "32..=33")]
    mini_sector_shift: u16,
    #[packed_field(bytes = "34..=35")]
    reserved1: u16,
    #[packed_field(bytes = "36..=39")]
    reserved2: u32,
    #[packed_field(bytes = "40..=43")]
    num_dir_sectors: u32,
    #[packed_field(bytes = "44..=47")]
    num_fat_sectors: u32,
    #[packed_field(bytes = "48..=51")]
    first_dir_sector: u32,
    #[packed_field(bytes = "52..=55")]
    transaction_signature_number: u32,
    #[packed_field(bytes = "56..=59")]
    mini_stream_cutoff_size: u32,
    #[packed_field(bytes = "60..=63")]
    first_mini_fat_sector: u32,
    #[packed_field(bytes = "64..=67")]
    num_mini_fat_sectors: u32,
    #[packed_field(bytes = "68..=71")]
    first_difat_sector: u32,
    #[packed_field(bytes = "72..=75")]
    num_difat_sectors: u32,
}

impl OleHeader {
    fn validate_header(&self) -> Result<(), CryptoError> {
        validate!(self.magic == MAGIC, corrupt(0, "bad compound file signature"))?;
        validate!(self.clsid == ZERO_CLSID, corrupt(8, "non-zero header CLSID"))?;
        validate!(
            (self.dll_version == 3 && self.sector_shift == 9)
                || (self.dll_version == 4 && self.sector_shift == 12),
            corrupt(26, "sector size does not match major version")
        )?;
        validate!(self.byte_order == BYTE_ORDER, corrupt(28, "bad byte order mark"))?;
        validate!(self.mini_sector_shift == 6, corrupt(32, "bad mini sector shift"))?;
        validate!(
            self.reserved1 == 0 && self.reserved2 == 0,
            corrupt(34, "reserved header bytes are set")
        )?;
        validate!(
            self.dll_version == 4 || self.num_dir_sectors == 0,
            corrupt(40, "directory sector count set in a version 3 file")
        )?;
        validate!(
            self.mini_stream_cutoff_size == MINI_STREAM_CUTOFF,
            corrupt(56, "bad mini stream cutoff")
        )?;

        Ok(())
    }
}

pub(crate) fn has_magic(raw: &[u8]) -> bool {
    raw.starts_with(&MAGIC)
}

/// Reader over a compound file, either owned or borrowed from the caller.
#[derive(Debug)]
pub(crate) struct OleFile<'a> {
    raw: Cow<'a, [u8]>,
    header: OleHeader,
    sector_size: usize,
    mini_sector_size: usize,
    nb_sect: usize,
    used_streams_fat: Vec<u32>,
    used_streams_minifat: Vec<u32>,
    fat: Vec<u32>,
    minifat: Vec<u32>,
    directory_fp: OleStream,
    direntries: Vec<Option<OleDirentry>>,
    ministream: Option<OleStream>,
    root_sid: usize,
}

impl<'a> OleFile<'a> {
    pub fn new(raw: impl Into<Cow<'a, [u8]>>) -> Result<Self, CryptoError> {
        let raw = raw.into();
        validate!(
            raw.len() >= 512,
            corrupt(raw.len(), "file is shorter than a compound file header")
        )?;

        let mut header_bytes = [0u8; HEADER_LENGTH];
        header_bytes.copy_from_slice(&raw[..HEADER_LENGTH]);
        let header = OleHeader::unpack(&header_bytes)
            .map_err(|_| corrupt(0, "unreadable compound file header"))?;
        header.validate_header()?;

        let sector_size = 1usize << header.sector_shift;
        let mini_sector_size = 1usize << header.mini_sector_shift;
        validate!(
            raw.len() >= sector_size,
            corrupt(raw.len(), "file is shorter than its header sector")
        )?;
        let nb_sect = raw.len().div_ceil(sector_size) - 1;

        Ok(Self {
            raw,
            header,
            sector_size,
            mini_sector_size,
            nb_sect,
            used_streams_fat: Vec::new(),
            used_streams_minifat: Vec::new(),
            fat: Vec::new(),
            minifat: Vec::new(),
            directory_fp: OleStream::default(),
            direntries: Vec::new(),
            ministream: None,
            root_sid: 0,
        })
    }

    pub fn init(&mut self) -> Result<(), CryptoError> {
        self.check_duplicate_stream(self.header.first_dir_sector, false)?;
        if self.header.num_mini_fat_sectors > 0 {
            // the MiniFAT itself lives in regular sectors
            self.check_duplicate_stream(self.header.first_mini_fat_sector, false)?;
        }
        if self.header.num_difat_sectors > 0 {
            self.check_duplicate_stream(self.header.first_difat_sector, false)?;
        }

        self.load_fat()?;
        self.load_directory(self.header.first_dir_sector)
    }

    /// Resolve `path` (storage names then a stream name) from the root storage, ignoring case.
    fn find(&self, path: &[&str]) -> Option<&OleDirentry> {
        let mut node = self.direntries.get(self.root_sid)?.as_ref()?;
        for name in path {
            let sid = *node.children_map.get(&name.to_lowercase())?;
            node = self.direntries.get(sid)?.as_ref()?;
        }

        Some(node)
    }

    pub fn has_stream(&self, path: &[&str]) -> bool {
        self.find(path)
            .map_or(false, |entry| entry.packed.entry_type == STGTY_STREAM)
    }

    pub fn open_stream(&mut self, path: &[&str]) -> Result<Vec<u8>, CryptoError> {
        let (start, size) = match self.find(path) {
            Some(entry) if entry.packed.entry_type == STGTY_STREAM => {
                (entry.packed.isect_start, entry.size)
            }
            _ => return Err(corrupt(0, "required stream is missing")),
        };

        Ok(self.open_helper(start, size, false)?.stream)
    }

    fn check_duplicate_stream(&mut self, first_sect: u32, minifat: bool) -> Result<(), CryptoError> {
        if minifat {
            validate!(
                !self.used_streams_minifat.contains(&first_sect),
                corrupt(first_sect, "two streams share a mini sector chain")
            )?;
            self.used_streams_minifat.push(first_sect);
        } else {
            if [DIFSECT, FATSECT, ENDOFCHAIN, FREESECT].contains(&first_sect) {
                return Ok(());
            }
            validate!(
                !self.used_streams_fat.contains(&first_sect),
                corrupt(self.sector_offset(first_sect), "two streams share a sector chain")
            )?;
            self.used_streams_fat.push(first_sect);
        }

        Ok(())
    }

    fn sector_offset(&self, sect: u32) -> u64 {
        (sect as u64 + 1) * self.sector_size as u64
    }

    /// A whole sector of the file as little-endian `u32` entries.
    fn sector_entries(&self, sect: u32, context: &'static str) -> Result<Vec<u32>, CryptoError> {
        let start = usize::try_from(self.sector_offset(sect)).map_err(|_| corrupt(u64::MAX, context))?;
        let bytes = start
            .checked_add(self.sector_size)
            .and_then(|end| self.raw.get(start..end))
            .ok_or_else(|| corrupt(start, context))?;

        Ok(le_entries(bytes))
    }

    fn load_fat_sect(&mut self, sects: &[u32]) -> Result<(), CryptoError> {
        for &isect in sects {
            if isect == ENDOFCHAIN || isect == FREESECT {
                break;
            }
            let next_fat = self.sector_entries(isect, "FAT sector beyond end of file")?;
            self.fat.extend_from_slice(&next_fat);
        }

        Ok(())
    }

    fn load_fat(&mut self) -> Result<(), CryptoError> {
        let header_difat = le_entries(&self.raw[HEADER_LENGTH..512]);
        self.load_fat_sect(&header_difat)?;

        // more than 109 FAT sectors (a file past ~6.8MB) continue in DIFAT sectors
        if self.header.num_difat_sectors > 0 {
            validate!(
                self.header.num_fat_sectors as usize > HEADER_DIFAT_ENTRIES,
                corrupt(44, "DIFAT sectors present for a small FAT")
            )?;
            validate!(
                (self.header.first_difat_sector as usize) < self.nb_sect,
                corrupt(68, "first DIFAT sector beyond end of file")
            )?;
            // each DIFAT sector ends with the id of the next one
            let per_difat = self.sector_size / 4 - 1;
            let nb_difat = (self.header.num_fat_sectors as usize - HEADER_DIFAT_ENTRIES)
                .div_ceil(per_difat);
            validate!(
                self.header.num_difat_sectors as usize == nb_difat,
                corrupt(72, "DIFAT sector count does not match FAT sector count")
            )?;

            let mut isect_difat = self.header.first_difat_sector;
            for _ in 0..nb_difat {
                let difat = self.sector_entries(isect_difat, "DIFAT sector beyond end of file")?;
                self.load_fat_sect(&difat[..per_difat])?;
                isect_difat = difat[per_difat];
            }

            validate!(
                [ENDOFCHAIN, FREESECT].contains(&isect_difat),
                corrupt(self.sector_offset(isect_difat), "DIFAT chain does not terminate")
            )?;
        }

        self.fat.truncate(self.nb_sect);

        Ok(())
    }

    fn load_directory(&mut self, sect: u32) -> Result<(), CryptoError> {
        self.directory_fp = self.open_helper(sect, UNKNOWN_SIZE, true)?;
        let max_entries = self.directory_fp.stream.len() / DIRENTRY_LENGTH;
        validate!(max_entries > 0, corrupt(self.sector_offset(sect), "empty directory"))?;

        self.direntries = vec![None; max_entries];
        self.load_direntry(self.root_sid)?;
        self.build_storage_tree()
    }

    fn load_direntry(&mut self, sid: usize) -> Result<(), CryptoError> {
        let start = sid * DIRENTRY_LENGTH;
        validate!(
            sid < self.direntries.len(),
            corrupt(start, "directory entry id out of range")
        )?;
        // an entry reachable twice means a cycle in the sibling trees
        validate!(
            self.direntries[sid].is_none(),
            corrupt(start, "directory entry referenced twice")
        )?;

        let mut entry = [0u8; DIRENTRY_LENGTH];
        entry.copy_from_slice(&self.directory_fp.stream[start..start + DIRENTRY_LENGTH]);
        let direntry = OleDirentry::new(entry, sid, self)?;
        self.direntries[sid] = Some(direntry);

        Ok(())
    }

    fn direntry(&self, sid: usize) -> Result<&OleDirentry, CryptoError> {
        self.direntries
            .get(sid)
            .and_then(Option::as_ref)
            .ok_or_else(|| corrupt(sid * DIRENTRY_LENGTH, "directory entry not loaded"))
    }

    fn load_minifat(&mut self) -> Result<(), CryptoError> {
        // The MiniFAT stream may be allocated larger than needed; only the entries covering the
        // mini stream (root entry size / mini sector size) are meaningful.
        let stream_size = self.header.num_mini_fat_sectors as u64 * self.sector_size as u64;
        let root_size = self.direntry(self.root_sid)?.size;
        let nb_minisectors = root_size.div_ceil(self.mini_sector_size as u64) as usize;

        let s = self.open_helper(self.header.first_mini_fat_sector, stream_size, true)?;
        let mut minifat = le_entries(&s.stream);
        validate!(
            nb_minisectors <= minifat.len(),
            corrupt(60, "MiniFAT is smaller than the mini stream")
        )?;
        minifat.truncate(nb_minisectors);
        self.minifat = minifat;

        Ok(())
    }

    fn open_helper(&mut self, start: u32, size: u64, force_fat: bool) -> Result<OleStream, CryptoError> {
        if size < self.header.mini_stream_cutoff_size as u64 && !force_fat {
            let ministream = match self.ministream.take() {
                Some(ministream) => ministream,
                None => {
                    self.load_minifat()?;
                    let root = self.direntry(self.root_sid)?;
                    let (root_start, root_size) = (root.packed.isect_start, root.size);
                    self.open_helper(root_start, root_size, true)?
                }
            };

            let mut olestream = OleStream::new(start, size, 0, self.mini_sector_size);
            let loaded = olestream.init(&ministream.stream, &self.minifat);
            self.ministream = Some(ministream);
            loaded?;

            Ok(olestream)
        } else {
            let mut olestream = OleStream::new(start, size, self.sector_size, self.sector_size);
            olestream.init(&self.raw, &self.fat)?;

            Ok(olestream)
        }
    }

    /// Index every storage's children by lowercase name. Sibling trees are walked without
    /// trusting their red-black shape, only that each entry is reached once.
    fn build_storage_tree(&mut self) -> Result<(), CryptoError> {
        let root_child = self.direntry(self.root_sid)?.packed.sid_child;
        let mut pending = vec![(self.root_sid, root_child)];

        while let Some((parent_sid, child_sid)) = pending.pop() {
            if child_sid == NOSTREAM {
                continue;
            }
            let child_sid = child_sid as usize;
            self.load_direntry(child_sid)?;

            let child = self.direntry(child_sid)?;
            let name_lower = child.name.to_lowercase();
            let (left, right, grandchild) = (
                child.packed.sid_left,
                child.packed.sid_right,
                child.packed.sid_child,
            );

            let parent = self.direntries[parent_sid]
                .as_mut()
                .ok_or_else(|| corrupt(parent_sid * DIRENTRY_LENGTH, "directory entry not loaded"))?;
            validate!(
                !parent.children_map.contains_key(&name_lower),
                corrupt(child_sid * DIRENTRY_LENGTH, "duplicate name in storage")
            )?;
            parent.children_map.insert(name_lower, child_sid);

            pending.push((parent_sid, left));
            pending.push((parent_sid, right));
            pending.push((child_sid, grandchild));
        }

        Ok(())
    }
}

#[derive(Default, Debug)]
pub(crate) struct OleStream {
    pub stream: Vec<u8>,
    start: u32,
    size: u64,
    offset: usize,
    sector_size: usize,
}

impl OleStream {
    pub fn new(start: u32, size: u64, offset: usize, sector_size: usize) -> Self {
        OleStream {
            stream: Vec::new(),
            start,
            size,
            offset,
            sector_size,
        }
    }

    /// Follow the sector chain from `start` through `fat`, reading sectors out of `raw`.
    fn init(&mut self, raw: &[u8], fat: &[u32]) -> Result<(), CryptoError> {
        let mut unknown_size = false;
        let fat_len = fat.len() as u64;

        if self.size == UNKNOWN_SIZE {
            self.size = fat_len * self.sector_size as u64;
            unknown_size = true;
        }

        let nb_sectors = self.size.div_ceil(self.sector_size as u64);
        validate!(
            nb_sectors <= fat_len,
            corrupt(self.size, "stream is larger than its allocation table")
        )?;
        let mut sect = self.start;
        validate!(
            self.size != 0 || sect == ENDOFCHAIN,
            corrupt(sect, "empty stream has a sector chain")
        )?;

        let mut data: Vec<u8> = Vec::with_capacity(self.size.min(raw.len() as u64) as usize);
        for _ in 0..nb_sectors {
            if sect == ENDOFCHAIN {
                validate!(unknown_size, corrupt(data.len(), "sector chain ends early"))?;
                break;
            }
            validate!(
                (sect as u64) < fat_len,
                corrupt(data.len(), "sector chain points outside the allocation table")
            )?;

            let start = self.offset + self.sector_size * sect as usize;
            validate!(start < raw.len(), corrupt(start, "sector beyond end of file"))?;
            // the file's last sector may be stored short
            let end = (start + self.sector_size).min(raw.len());
            data.extend_from_slice(&raw[start..end]);

            sect = fat[sect as usize];
        }

        if data.len() as u64 >= self.size {
            data.truncate(self.size as usize);
        } else if unknown_size {
            self.size = data.len() as u64;
        } else {
            return Err(corrupt(data.len(), "stream is shorter than its recorded size"));
        }

        self.stream = data;

        Ok(())
    }
}

#[derive(PackedStruct, Derivative, Debug, Clone)]
#[packed_struct(endian = "lsb", bit_numbering = "msb0")]
#[derivative(Default)]
pub(crate) struct OleDirentryPacked {
    #[packed_field(bytes = "0..=63")]
    // workaround since Default isnt implemented for [T; >32]
    #[derivative(Default(value = "[0; 64]"))]
    name_raw: [u8; 64],
    #[packed_field(bytes = "64..=65")]
    name_length: u16,
    #[packed_field(bytes = "66..=66")]
    entry_type: u8,
    #[packed_field(bytes = "67..=67")]
    color: u8,
    #[packed_field(bytes = "68..=71")]
    sid_left: u32,
    #[packed_field(bytes = "72..=75")]
    sid_right: u32,
    #[packed_field(bytes = "76..=79")]
    sid_child: u32,
    #[packed_field(bytes = "80..=95")]
    clsid: [u8; 16],
    #[packed_field(bytes = "96..=99")]
    dw_user_flags: u32,
    #[packed_field(bytes = "100..=107")]
    create_time: u64,
    #[packed_field(bytes = "108..=115")]
    modify_time: u64,
    #[packed_field(bytes = "116..=119")]
    isect_start: u32,
    #[packed_field(bytes = "120..=123")]
    size_low: u32,
    #[packed_field(bytes = "124..=127")]
    size_high: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct OleDirentry {
    packed: OleDirentryPacked,
    name: String,
    size: u64,
    children_map: HashMap<String, usize>,
}

impl OleDirentry {
    pub fn new(entry: [u8; DIRENTRY_LENGTH], sid: usize, olefile: &mut OleFile<'_>) -> Result<Self, CryptoError> {
        let offset = sid * DIRENTRY_LENGTH;
        let packed = OleDirentryPacked::unpack(&entry)
            .map_err(|_| corrupt(offset, "unreadable directory entry"))?;

        validate!(
            [STGTY_ROOT, STGTY_STORAGE, STGTY_STREAM, STGTY_EMPTY].contains(&packed.entry_type),
            corrupt(offset + 66, "unknown directory entry type")
        )?;
        validate!(
            (packed.entry_type == STGTY_ROOT) == (sid == 0),
            corrupt(offset + 66, "root entry is not the first directory entry")
        )?;
        validate!(
            packed.name_length as usize <= packed.name_raw.len() && packed.name_length % 2 == 0,
            corrupt(offset + 64, "bad directory entry name length")
        )?;

        // name_length counts the UTF-16 terminator
        let name_bytes = &packed.name_raw[..(packed.name_length as usize).saturating_sub(2)];
        let name_utf16: Vec<u16> = pod_collect_to_vec::<u8, u16>(name_bytes)
            .into_iter()
            .map(u16::from_le)
            .collect();
        let name = String::from_utf16(&name_utf16)
            .map_err(|_| corrupt(offset, "directory entry name is not UTF-16"))?;

        let size = if olefile.sector_size == 512 {
            packed.size_low as u64
        } else {
            packed.size_low as u64 + ((packed.size_high as u64) << 32)
        };

        validate!(
            packed.entry_type != STGTY_STORAGE || size == 0,
            corrupt(offset + 120, "storage entry has a size")
        )?;

        if [STGTY_ROOT, STGTY_STREAM].contains(&packed.entry_type) && size > 0 {
            let minifat = size < olefile.header.mini_stream_cutoff_size as u64
                && packed.entry_type == STGTY_STREAM;
            olefile.check_duplicate_stream(packed.isect_start, minifat)?;
        }

        Ok(OleDirentry {
            packed,
            name,
            size,
            children_map: HashMap::new(),
        })
    }
}

fn le_entries(bytes: &[u8]) -> Vec<u32> {
    pod_collect_to_vec::<u8, u32>(bytes)
        .into_iter()
        .map(u32::from_le)
        .collect()
}
