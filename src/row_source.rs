use memmap2::Mmap;
use ndarray::Array2;
use std::fs::File;
use std::io::{Error, ErrorKind, Result, Write};
use std::mem;
use std::path::Path;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Source of dense rows for a clustering run.
///
/// The engine calls back into the source whenever a row has to be
/// materialized (a cache miss, or a pass with no cache). Row ids are dense
/// in `0..num_rows` and every row is exactly `num_cols` doubles. The source
/// is shared by all workers, so lookups must be safe to issue concurrently.
pub trait RowSource: Sync {
    fn num_rows(&self) -> usize;

    fn num_cols(&self) -> usize;

    /// Materialize one row as a borrowed slice of `num_cols` values.
    fn row(&self, row_id: usize) -> Result<&[f64]>;
}

/// All rows resident in memory, row-major.
pub struct MemRows {
    data: Vec<f64>,
    nrows: usize,
    ncols: usize,
}

impl MemRows {
    pub fn new(data: Array2<f64>) -> Self {
        let (nrows, ncols) = data.dim();
        MemRows {
            data: data.iter().copied().collect(),
            nrows,
            ncols,
        }
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let nrows = rows.len();
        let ncols = rows.first().map_or(0, |r| r.len());
        let mut data = Vec::with_capacity(nrows * ncols);
        for row in &rows {
            assert_eq!(row.len(), ncols, "ragged row matrix");
            data.extend_from_slice(row);
        }
        MemRows { data, nrows, ncols }
    }
}

impl RowSource for MemRows {
    fn num_rows(&self) -> usize {
        self.nrows
    }

    fn num_cols(&self) -> usize {
        self.ncols
    }

    fn row(&self, row_id: usize) -> Result<&[f64]> {
        if row_id >= self.nrows {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("row {} out of range", row_id),
            ));
        }
        let start = row_id * self.ncols;
        Ok(&self.data[start..start + self.ncols])
    }
}

const ROW_FILE_MAGIC: u64 = u64::from_le_bytes(*b"ROWMAT64");
const ROW_FILE_VERSION: u32 = 1;

// Header at the start of the file; 32 bytes, so row data stays 8-aligned.
#[repr(C)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
struct RowFileHeader {
    magic: u64,
    version: u32,
    ncols: u32,
    nrows: u64,
    _reserved: u64,
}

/// Memory-mapped row matrix on disk: a [`RowFileHeader`] followed by
/// `nrows * ncols` packed little-endian doubles. Rows are handed out by
/// reference straight from the mapping.
pub struct MmapRows {
    mmap: Mmap,
    nrows: usize,
    ncols: usize,
}

impl MmapRows {
    /// Write `data` into the row-file format at `path`.
    pub fn create(path: impl AsRef<Path>, data: &Array2<f64>) -> Result<()> {
        let (nrows, ncols) = data.dim();
        let mut file = File::create(path)?;

        let header = RowFileHeader {
            magic: ROW_FILE_MAGIC,
            version: ROW_FILE_VERSION,
            ncols: ncols as u32,
            nrows: nrows as u64,
            _reserved: 0,
        };
        file.write_all(header.as_bytes())?;

        match data.as_slice() {
            Some(flat) => file.write_all(IntoBytes::as_bytes(flat))?,
            None => {
                for row in data.rows() {
                    let row: Vec<f64> = row.iter().copied().collect();
                    file.write_all(IntoBytes::as_bytes(&row[..]))?;
                }
            }
        }
        Ok(())
    }

    /// Map an existing row file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let header_size = mem::size_of::<RowFileHeader>();
        if mmap.len() < header_size {
            return Err(Error::new(ErrorKind::InvalidData, "row file too short"));
        }
        let (header, _) = RowFileHeader::ref_from_prefix(&mmap[..header_size])
            .map_err(|_| Error::new(ErrorKind::InvalidData, "invalid row file header"))?;

        if header.magic != ROW_FILE_MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "bad row file magic"));
        }
        if header.version != ROW_FILE_VERSION {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("unsupported row file version {}", header.version),
            ));
        }

        let nrows = header.nrows as usize;
        let ncols = header.ncols as usize;
        let expected = header_size + nrows * ncols * mem::size_of::<f64>();
        if mmap.len() != expected {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "row file size mismatch: expected {} bytes, found {}",
                    expected,
                    mmap.len()
                ),
            ));
        }

        Ok(MmapRows { mmap, nrows, ncols })
    }
}

impl RowSource for MmapRows {
    fn num_rows(&self) -> usize {
        self.nrows
    }

    fn num_cols(&self) -> usize {
        self.ncols
    }

    fn row(&self, row_id: usize) -> Result<&[f64]> {
        if row_id >= self.nrows {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("row {} out of range", row_id),
            ));
        }
        let row_bytes = self.ncols * mem::size_of::<f64>();
        let start = mem::size_of::<RowFileHeader>() + row_id * row_bytes;
        <[f64]>::ref_from_bytes(&self.mmap[start..start + row_bytes])
            .map_err(|_| Error::new(ErrorKind::InvalidData, "misaligned row data"))
    }
}
