use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

pub type Result<T> = std::result::Result<T, NpyError>;

#[derive(Error, Debug)]
pub enum NpyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not an .npy file")]
    BadMagic,

    #[error("Unsupported .npy version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("Unsupported .npy header: {0}")]
    UnsupportedHeader(String),

    #[error("Row {row} has {actual} columns, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        actual: usize,
    },
}

/// Row-major matrix of `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Matrix {
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(NpyError::RaggedRow {
                    row: i,
                    expected: cols,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

pub fn write_matrix(path: &Path, matrix: &Matrix) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_to(&mut writer, matrix)?;
    writer.flush()?;
    Ok(())
}

pub fn write_to<W: Write>(writer: &mut W, matrix: &Matrix) -> Result<()> {
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}), }}",
        matrix.rows, matrix.cols
    );
    // magic(6) + version(2) + header_len(2) + header + '\n' must be 64-aligned
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    let header_len = u16::try_from(header.len())
        .map_err(|_| NpyError::UnsupportedHeader("header too long".to_string()))?;

    writer.write_all(MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(header.as_bytes())?;
    for value in &matrix.data {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

pub fn read_matrix(path: &Path) -> Result<Matrix> {
    let mut reader = BufReader::new(File::open(path)?);
    read_from(&mut reader)
}

pub fn read_from<R: Read>(reader: &mut R) -> Result<Matrix> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(NpyError::BadMagic);
    }

    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let header_len = match version[0] {
        1 => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len)?;
            u16::from_le_bytes(len) as usize
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            u32::from_le_bytes(len) as usize
        }
        _ => return Err(NpyError::UnsupportedVersion(version[0], version[1])),
    };

    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);
    let (rows, cols) = parse_header(&header)?;

    let mut bytes = vec![0u8; rows * cols * 4];
    reader.read_exact(&mut bytes)?;
    let data = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(Matrix { rows, cols, data })
}

fn parse_header(header: &str) -> Result<(usize, usize)> {
    let descr = dict_value(header, "descr")
        .ok_or_else(|| NpyError::UnsupportedHeader("missing descr".to_string()))?;
    if !matches!(descr.trim_matches(|c| c == '\'' || c == '"'), "<f4" | "f4") {
        return Err(NpyError::UnsupportedHeader(format!("dtype {}", descr)));
    }

    let fortran = dict_value(header, "fortran_order").unwrap_or("False");
    if fortran.trim() != "False" {
        return Err(NpyError::UnsupportedHeader(
            "fortran_order arrays".to_string(),
        ));
    }

    let shape_start = header
        .find('(')
        .ok_or_else(|| NpyError::UnsupportedHeader("missing shape".to_string()))?;
    let shape_end = header[shape_start..]
        .find(')')
        .map(|i| shape_start + i)
        .ok_or_else(|| NpyError::UnsupportedHeader("unterminated shape".to_string()))?;

    let dims = header[shape_start + 1..shape_end]
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| {
            d.parse::<usize>()
                .map_err(|_| NpyError::UnsupportedHeader(format!("shape dim {}", d)))
        })
        .collect::<Result<Vec<_>>>()?;

    match dims.as_slice() {
        [rows, cols] => Ok((*rows, *cols)),
        // np.save(np.array([])) gives shape (0,)
        [0] => Ok((0, 0)),
        _ => Err(NpyError::UnsupportedHeader(format!(
            "expected 2-D shape, got {:?}",
            dims
        ))),
    }
}

fn dict_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let quoted = format!("'{}'", key);
    let start = header.find(&quoted)? + quoted.len();
    let rest = header[start..].trim_start().strip_prefix(':')?;
    let end = rest.find(',').unwrap_or(rest.len());
    Some(rest[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_aligned() {
        let matrix = Matrix::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        let mut buf = Vec::new();
        write_to(&mut buf, &matrix).unwrap();

        let header_len = u16::from_le_bytes([buf[8], buf[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(buf[10 + header_len - 1], b'\n');
        assert_eq!(buf.len(), 10 + header_len + 6 * 4);

        let back = read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(back, matrix);
        assert_eq!(back.row(1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_reads_numpy_written_header() {
        // Header as emitted by numpy 1.x for np.zeros((1, 2), dtype=np.float32)
        let header = "{'descr': '<f4', 'fortran_order': False, 'shape': (1, 2), }";
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&[1, 0]);
        let padded = format!("{:<width$}\n", header, width = 117);
        buf.extend_from_slice(&(padded.len() as u16).to_le_bytes());
        buf.extend_from_slice(padded.as_bytes());
        buf.extend_from_slice(&0.5f32.to_le_bytes());
        buf.extend_from_slice(&(-1.5f32).to_le_bytes());

        let matrix = read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(matrix.rows, 1);
        assert_eq!(matrix.data, vec![0.5, -1.5]);
    }

    #[test]
    fn test_rejects_float64() {
        let err = parse_header("{'descr': '<f8', 'fortran_order': False, 'shape': (2, 2), }")
            .unwrap_err();
        assert!(matches!(err, NpyError::UnsupportedHeader(_)));
    }

    #[test]
    fn test_ragged_rows() {
        let err = Matrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).unwrap_err();
        assert!(matches!(err, NpyError::RaggedRow { row: 1, .. }));
    }

    #[test]
    fn test_empty_matrix() {
        let matrix = Matrix::from_rows(&[]).unwrap();
        let mut buf = Vec::new();
        write_to(&mut buf, &matrix).unwrap();
        let back = read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(back.rows, 0);
        assert!(back.data.is_empty());
    }
}
