use super::{
    OleDirentryPacked, OleHeader, BYTE_ORDER, DIFSECT, DIRENTRY_LENGTH, ENDOFCHAIN, FATSECT,
    FREESECT, HEADER_DIFAT_ENTRIES, MAGIC, MINI_STREAM_CUTOFF, NOSTREAM,
    STGTY_ROOT, STGTY_STORAGE, STGTY_STREAM, ZERO_CLSID,
};
use crate::{validate, CryptoError};

use packed_struct::prelude::*;
use std::cmp::Ordering;
use tracing::debug;

const SECTOR_SIZE: usize = 512;
const MINI_SECTOR_SIZE: usize = 64;
const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / 4;
const DIRENTRIES_PER_SECTOR: usize = SECTOR_SIZE / DIRENTRY_LENGTH;
const MAX_NAME_UNITS: usize = 31;

const COLOR_RED: u8 = 0;
const COLOR_BLACK: u8 = 1;

enum NodeKind {
    Root,
    Storage,
    Stream(Vec<u8>),
}

struct Node {
    name: String,
    kind: NodeKind,
    children: Vec<usize>,
}

/// Builds a version 3 compound file (512-byte sectors) in memory.
pub(crate) struct OleWriter {
    nodes: Vec<Node>,
}

/// Where a stream's bytes ended up: regular sector or mini sector chain start.
#[derive(Clone, Copy)]
struct Placement {
    start: u32,
    size: u32,
}

impl OleWriter {
    pub fn new() -> Self {
        OleWriter {
            nodes: vec![Node {
                name: "Root Entry".to_owned(),
                kind: NodeKind::Root,
                children: Vec::new(),
            }],
        }
    }

    pub fn add_storage(&mut self, path: &[&str]) -> Result<(), CryptoError> {
        self.add_node(path, NodeKind::Storage)
    }

    pub fn add_stream(&mut self, path: &[&str], data: Vec<u8>) -> Result<(), CryptoError> {
        validate!(
            u32::try_from(data.len()).is_ok(),
            CryptoError::InvalidInput("stream is too large for a version 3 compound file")
        )?;
        self.add_node(path, NodeKind::Stream(data))
    }

    fn add_node(&mut self, path: &[&str], kind: NodeKind) -> Result<(), CryptoError> {
        let (name, parents) = path
            .split_last()
            .ok_or(CryptoError::InvalidInput("empty compound file path"))?;
        validate!(
            !name.is_empty() && name.encode_utf16().count() <= MAX_NAME_UNITS,
            CryptoError::InvalidInput("compound file entry names must be 1 to 31 UTF-16 units")
        )?;

        let mut parent = 0;
        for storage in parents {
            parent = self
                .child(parent, storage)
                .filter(|index| matches!(self.nodes[*index].kind, NodeKind::Storage))
                .ok_or(CryptoError::InvalidInput("parent storage does not exist"))?;
        }
        validate!(
            self.child(parent, name).is_none(),
            CryptoError::InvalidInput("duplicate compound file entry name")
        )?;

        let index = self.nodes.len();
        self.nodes.push(Node {
            name: (*name).to_owned(),
            kind,
            children: Vec::new(),
        });
        self.nodes[parent].children.push(index);

        Ok(())
    }

    fn child(&self, parent: usize, name: &str) -> Option<usize> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|index| self.nodes[*index].name.to_lowercase() == name.to_lowercase())
    }

    pub fn finish(self) -> Result<Vec<u8>, CryptoError> {
        let mut placements = vec![
            Placement {
                start: ENDOFCHAIN,
                size: 0,
            };
            self.nodes.len()
        ];

        // streams under the cutoff are packed into the mini stream
        let mut ministream: Vec<u8> = Vec::new();
        let mut minifat: Vec<u32> = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if let NodeKind::Stream(data) = &node.kind {
                if !data.is_empty() && data.len() < MINI_STREAM_CUTOFF as usize {
                    let start = minifat.len() as u32;
                    let count = data.len().div_ceil(MINI_SECTOR_SIZE);
                    push_chain(&mut minifat, start, count);
                    ministream.extend_from_slice(data);
                    ministream.resize(minifat.len() * MINI_SECTOR_SIZE, 0);
                    placements[index] = Placement {
                        start,
                        size: data.len() as u32,
                    };
                }
            }
        }

        let dir_sectors = self.nodes.len().div_ceil(DIRENTRIES_PER_SECTOR);
        let minifat_sectors = minifat.len().div_ceil(ENTRIES_PER_SECTOR);
        let ministream_sectors = ministream.len().div_ceil(SECTOR_SIZE);
        let big_sectors: usize = self
            .nodes
            .iter()
            .map(|node| match &node.kind {
                NodeKind::Stream(data) if data.len() >= MINI_STREAM_CUTOFF as usize => {
                    data.len().div_ceil(SECTOR_SIZE)
                }
                _ => 0,
            })
            .sum();
        let data_sectors = dir_sectors + minifat_sectors + ministream_sectors + big_sectors;

        // the FAT has to describe its own sectors and the DIFAT sectors that locate it
        let (mut fat_sectors, mut difat_sectors) = (0, 0);
        loop {
            let total = data_sectors + fat_sectors + difat_sectors;
            let needed_fat = total.div_ceil(ENTRIES_PER_SECTOR);
            let needed_difat = needed_fat
                .saturating_sub(HEADER_DIFAT_ENTRIES)
                .div_ceil(ENTRIES_PER_SECTOR - 1);
            if needed_fat == fat_sectors && needed_difat == difat_sectors {
                break;
            }
            fat_sectors = needed_fat;
            difat_sectors = needed_difat;
        }

        let total_sectors = data_sectors + fat_sectors + difat_sectors;
        validate!(
            u32::try_from(total_sectors).map_or(false, |total| total < DIFSECT),
            CryptoError::InvalidInput("compound file is too large")
        )?;

        let mut fat: Vec<u32> = Vec::with_capacity(fat_sectors * ENTRIES_PER_SECTOR);
        fat.resize(fat_sectors, FATSECT);
        fat.resize(fat_sectors + difat_sectors, DIFSECT);
        let first_difat_sector = fat_sectors as u32;

        let first_dir_sector = fat.len() as u32;
        push_chain(&mut fat, first_dir_sector, dir_sectors);

        let first_minifat_sector = fat.len() as u32;
        push_chain(&mut fat, first_minifat_sector, minifat_sectors);

        let first_ministream_sector = fat.len() as u32;
        push_chain(&mut fat, first_ministream_sector, ministream_sectors);

        let mut big_streams: Vec<usize> = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if let NodeKind::Stream(data) = &node.kind {
                if data.len() >= MINI_STREAM_CUTOFF as usize {
                    let start = fat.len() as u32;
                    push_chain(&mut fat, start, data.len().div_ceil(SECTOR_SIZE));
                    placements[index] = Placement {
                        start,
                        size: data.len() as u32,
                    };
                    big_streams.push(index);
                }
            }
        }
        if ministream_sectors > 0 {
            placements[0] = Placement {
                start: first_ministream_sector,
                size: ministream.len() as u32,
            };
        }
        fat.resize(fat_sectors * ENTRIES_PER_SECTOR, FREESECT);

        let header = OleHeader {
            magic: MAGIC,
            clsid: ZERO_CLSID,
            minor_version: 0x3E,
            dll_version: 3,
            byte_order: BYTE_ORDER,
            sector_shift: 9,
            mini_sector_shift: 6,
            reserved1: 0,
            reserved2: 0,
            num_dir_sectors: 0,
            num_fat_sectors: fat_sectors as u32,
            first_dir_sector,
            transaction_signature_number: 0,
            mini_stream_cutoff_size: MINI_STREAM_CUTOFF,
            first_mini_fat_sector: if minifat_sectors > 0 {
                first_minifat_sector
            } else {
                ENDOFCHAIN
            },
            num_mini_fat_sectors: minifat_sectors as u32,
            first_difat_sector: if difat_sectors > 0 {
                first_difat_sector
            } else {
                ENDOFCHAIN
            },
            num_difat_sectors: difat_sectors as u32,
        };

        let mut out = Vec::with_capacity((total_sectors + 1) * SECTOR_SIZE);
        out.extend_from_slice(&header.pack().map_err(pack_error)?);

        // header DIFAT: the first 109 FAT sector ids
        let fat_ids: Vec<u32> = (0..fat_sectors as u32).collect();
        let header_difat = fat_ids.len().min(HEADER_DIFAT_ENTRIES);
        let mut difat = fat_ids[..header_difat].to_vec();
        difat.resize(HEADER_DIFAT_ENTRIES, FREESECT);
        push_entries(&mut out, &difat);

        push_entries(&mut out, &fat);

        for (i, chunk) in fat_ids[header_difat..]
            .chunks(ENTRIES_PER_SECTOR - 1)
            .enumerate()
        {
            let mut sector = chunk.to_vec();
            sector.resize(ENTRIES_PER_SECTOR - 1, FREESECT);
            let next = if i + 1 < difat_sectors {
                first_difat_sector + i as u32 + 1
            } else {
                ENDOFCHAIN
            };
            sector.push(next);
            push_entries(&mut out, &sector);
        }

        let tree = self.sibling_trees();
        for (index, node) in self.nodes.iter().enumerate() {
            out.extend_from_slice(&self.direntry(node, &tree[index], placements[index])?);
        }
        let empty = OleDirentryPacked {
            sid_left: NOSTREAM,
            sid_right: NOSTREAM,
            sid_child: NOSTREAM,
            ..Default::default()
        };
        for _ in self.nodes.len()..dir_sectors * DIRENTRIES_PER_SECTOR {
            out.extend_from_slice(&empty.pack().map_err(pack_error)?);
        }

        let mut minifat = minifat;
        minifat.resize(minifat_sectors * ENTRIES_PER_SECTOR, FREESECT);
        push_entries(&mut out, &minifat);

        push_padded(&mut out, &ministream);
        for index in big_streams {
            if let NodeKind::Stream(data) = &self.nodes[index].kind {
                push_padded(&mut out, data);
            }
        }

        debug!(
            entries = self.nodes.len(),
            sectors = total_sectors,
            fat_sectors,
            difat_sectors,
            "compound file assembled"
        );

        Ok(out)
    }

    fn direntry(&self, node: &Node, links: &Links, placement: Placement) -> Result<[u8; DIRENTRY_LENGTH], CryptoError> {
        let mut name_raw = [0u8; 64];
        let units: Vec<u16> = node.name.encode_utf16().collect();
        for (i, unit) in units.iter().enumerate() {
            name_raw[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }

        let entry_type = match node.kind {
            NodeKind::Root => STGTY_ROOT,
            NodeKind::Storage => STGTY_STORAGE,
            NodeKind::Stream(_) => STGTY_STREAM,
        };
        let placement = match node.kind {
            NodeKind::Storage => Placement { start: 0, size: 0 },
            _ => placement,
        };

        let packed = OleDirentryPacked {
            name_raw,
            name_length: ((units.len() + 1) * 2) as u16,
            entry_type,
            color: links.color,
            sid_left: links.left,
            sid_right: links.right,
            sid_child: links.child,
            isect_start: placement.start,
            size_low: placement.size,
            ..Default::default()
        };

        packed.pack().map_err(pack_error)
    }

    /// Lay every storage's children out as a balanced binary search tree in compound file
    /// name order. The deepest, partially filled level is colored red so that every path
    /// carries the same number of black entries.
    fn sibling_trees(&self) -> Vec<Links> {
        let mut links = vec![Links::default(); self.nodes.len()];
        links[0].color = COLOR_BLACK;

        for (index, node) in self.nodes.iter().enumerate() {
            if node.children.is_empty() {
                continue;
            }
            let mut sorted = node.children.clone();
            sorted.sort_by(|a, b| compare_names(&self.nodes[*a].name, &self.nodes[*b].name));

            let full_levels = (sorted.len() + 1).ilog2();
            links[index].child = place(&sorted, 0, full_levels, &mut links);
        }

        links
    }
}

#[derive(Clone)]
struct Links {
    left: u32,
    right: u32,
    child: u32,
    color: u8,
}

impl Default for Links {
    fn default() -> Self {
        Links {
            left: NOSTREAM,
            right: NOSTREAM,
            child: NOSTREAM,
            color: COLOR_BLACK,
        }
    }
}

fn place(sorted: &[usize], depth: u32, full_levels: u32, links: &mut [Links]) -> u32 {
    if sorted.is_empty() {
        return NOSTREAM;
    }
    let mid = sorted.len() / 2;
    let sid = sorted[mid];

    links[sid].left = place(&sorted[..mid], depth + 1, full_levels, links);
    links[sid].right = place(&sorted[mid + 1..], depth + 1, full_levels, links);
    links[sid].color = if depth >= full_levels {
        COLOR_RED
    } else {
        COLOR_BLACK
    };

    sid as u32
}

/// Shorter names sort first, equal lengths compare upper-cased UTF-16 code units.
fn compare_names(a: &str, b: &str) -> Ordering {
    let a: Vec<u16> = a.to_uppercase().encode_utf16().collect();
    let b: Vec<u16> = b.to_uppercase().encode_utf16().collect();
    a.len().cmp(&b.len()).then_with(|| a.cmp(&b))
}

fn push_chain(table: &mut Vec<u32>, start: u32, count: usize) {
    for i in 1..count {
        table.push(start + i as u32);
    }
    if count > 0 {
        table.push(ENDOFCHAIN);
    }
}

fn push_entries(out: &mut Vec<u8>, entries: &[u32]) {
    for entry in entries {
        out.extend_from_slice(&entry.to_le_bytes());
    }
}

fn push_padded(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
    out.resize(out.len().next_multiple_of(SECTOR_SIZE), 0);
}

fn pack_error(_: PackingError) -> CryptoError {
    CryptoError::InvalidInput("compound file structure could not be packed")
}

#[cfg(test)]
mod tests {
    use super::super::OleFile;
    use super::*;

    fn read_back(raw: Vec<u8>) -> OleFile<'static> {
        let mut olefile = OleFile::new(raw).unwrap();
        olefile.init().unwrap();
        olefile
    }

    #[test]
    fn output_is_whole_sectors() {
        let mut writer = OleWriter::new();
        writer.add_stream(&["a"], vec![1u8; 10]).unwrap();
        let raw = writer.finish().unwrap();

        assert_eq!(raw.len() % SECTOR_SIZE, 0);
        assert_eq!(&raw[..8], &MAGIC);
    }

    #[test]
    fn mini_and_regular_streams_at_the_cutoff() {
        let mut writer = OleWriter::new();
        writer.add_stream(&["below"], vec![1u8; 4095]).unwrap();
        writer.add_stream(&["at"], vec![2u8; 4096]).unwrap();
        writer.add_stream(&["empty"], Vec::new()).unwrap();
        let mut olefile = read_back(writer.finish().unwrap());

        assert_eq!(olefile.open_stream(&["below"]).unwrap(), vec![1u8; 4095]);
        assert_eq!(olefile.open_stream(&["at"]).unwrap(), vec![2u8; 4096]);
        assert!(olefile.open_stream(&["empty"]).unwrap().is_empty());
    }

    #[test]
    fn many_siblings_resolve() {
        let mut writer = OleWriter::new();
        for i in 0..40 {
            writer
                .add_stream(&[format!("stream{i}").as_str()], vec![i as u8; 70])
                .unwrap();
        }
        let mut olefile = read_back(writer.finish().unwrap());

        for i in 0..40 {
            assert_eq!(
                olefile.open_stream(&[format!("STREAM{i}").as_str()]).unwrap(),
                vec![i as u8; 70]
            );
        }
    }

    #[test]
    fn sibling_tree_is_ordered_and_balanced() {
        let mut writer = OleWriter::new();
        for name in ["ccc", "a", "bb", "B", "dddd", "e"] {
            writer.add_stream(&[name], vec![0u8; 8]).unwrap();
        }
        let links = writer.sibling_trees();

        // in-order walk of the root's children
        fn walk(sid: u32, links: &[Links], writer: &OleWriter, out: &mut Vec<String>) {
            if sid == NOSTREAM {
                return;
            }
            walk(links[sid as usize].left, links, writer, out);
            out.push(writer.nodes[sid as usize].name.clone());
            walk(links[sid as usize].right, links, writer, out);
        }
        let mut names = Vec::new();
        walk(links[0].child, &links, &writer, &mut names);
        assert_eq!(names, ["a", "B", "e", "bb", "ccc", "dddd"]);

        // black height is the same along every path
        fn black_heights(sid: u32, links: &[Links], acc: u32, out: &mut Vec<u32>) {
            if sid == NOSTREAM {
                out.push(acc);
                return;
            }
            let link = &links[sid as usize];
            let acc = acc + u32::from(link.color == COLOR_BLACK);
            black_heights(link.left, links, acc, out);
            black_heights(link.right, links, acc, out);
        }
        let mut heights = Vec::new();
        black_heights(links[0].child, &links, 0, &mut heights);
        assert!(heights.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn rejects_bad_paths() {
        let mut writer = OleWriter::new();
        writer.add_stream(&["data"], vec![1]).unwrap();

        assert!(writer.add_stream(&["DATA"], vec![2]).is_err());
        assert!(writer.add_stream(&["missing", "data"], vec![2]).is_err());
        assert!(writer.add_stream(&["data", "inner"], vec![2]).is_err());
        assert!(writer.add_stream(&[], vec![2]).is_err());
        assert!(writer.add_storage(&["x".repeat(32).as_str()]).is_err());
    }

    #[test]
    fn large_stream_needs_difat() {
        // 110 FAT sectors cover more than 109 * 128 sectors
        let len = 110 * ENTRIES_PER_SECTOR * SECTOR_SIZE;
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();

        let mut writer = OleWriter::new();
        writer.add_stream(&["Large"], data.clone()).unwrap();
        let raw = writer.finish().unwrap();

        let num_difat = u32::from_le_bytes(raw[72..76].try_into().unwrap());
        assert_eq!(num_difat, 1);

        let mut olefile = read_back(raw);
        assert!(olefile.open_stream(&["Large"]).unwrap() == data);
    }
}
