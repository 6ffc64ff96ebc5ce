//! Device key log preprocessing
//!
//! The QKD device writes its secret key log as sections introduced by a
//! marker line (`KEY...`) followed by one long bit-string line. The loader
//! expects one key per line, so before the context starts the log is cut
//! into fixed-width keys and written to the flat key file.

use crate::{Error, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, instrument, warn};

/// Prefix of the line announcing a key section
pub const KEY_MARKER: &str = "KEY";

/// Splits device key logs into fixed-width keys
#[derive(Debug, Clone, Copy)]
pub struct KeyLogChunker {
    width: usize,
}

impl Default for KeyLogChunker {
    fn default() -> Self {
        Self {
            width: crate::DEFAULT_CHUNK_WIDTH,
        }
    }
}

impl KeyLogChunker {
    pub fn new(width: usize) -> Result<Self> {
        if width == 0 {
            return Err(Error::Config("chunk width must be > 0".to_string()));
        }
        Ok(Self { width })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Cut a bit string into keys of exactly `width` characters
    ///
    /// A chunk is only taken while the remainder is strictly longer than
    /// the width, so the tail (up to `width` characters) is never emitted.
    pub fn chunks<'a>(&self, bits: &'a str) -> Result<Vec<&'a str>> {
        if !bits.is_ascii() {
            return Err(Error::Validation(
                "key bit string contains non-ASCII characters".to_string(),
            ));
        }

        let mut keys = Vec::with_capacity(bits.len() / self.width);
        let mut rest = bits;
        while rest.len() > self.width {
            let (key, tail) = rest.split_at(self.width);
            keys.push(key);
            rest = tail;
        }
        Ok(keys)
    }

    /// Rewrite a device log as one key per line
    ///
    /// Returns the number of keys written.
    pub fn transform<R: BufRead, W: Write>(&self, reader: R, mut writer: W) -> Result<usize> {
        let mut written = 0;
        let mut lines = reader.lines();

        while let Some(line) = lines.next() {
            if !line?.starts_with(KEY_MARKER) {
                continue;
            }

            let Some(bits) = lines.next() else {
                warn!("Key marker at end of log without a key line");
                break;
            };
            let bits = bits?;

            for key in self.chunks(bits.trim_end_matches('\r'))? {
                writeln!(writer, "{}", key)?;
                written += 1;
            }
        }

        writer.flush()?;
        Ok(written)
    }

    /// Rewrite the device log at `input` into the flat key file at `output`
    #[instrument(skip(self), fields(width = self.width))]
    pub fn transform_file(&self, input: &Path, output: &Path) -> Result<usize> {
        let reader = BufReader::new(File::open(input)?);
        let writer = BufWriter::new(File::create(output)?);
        let written = self.transform(reader, writer)?;

        info!(
            "Wrote {} keys from {} to {}",
            written,
            input.display(),
            output.display()
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn test_tail_is_dropped() {
        let chunker = KeyLogChunker::new(4).unwrap();
        assert_eq!(chunker.chunks("0101101").unwrap(), vec!["0101"]);
        assert_eq!(chunker.chunks("01011010").unwrap(), vec!["0101"]);
        assert_eq!(chunker.chunks("010110101").unwrap(), vec!["0101", "1010"]);
        assert!(chunker.chunks("0101").unwrap().is_empty());
        assert!(chunker.chunks("").unwrap().is_empty());
    }

    #[test]
    fn test_default_width() {
        let chunker = KeyLogChunker::default();
        assert_eq!(chunker.width(), 767);

        let bits = "1".repeat(767 * 2 + 5);
        let keys = chunker.chunks(&bits).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.len() == 767));
    }

    #[test]
    fn test_zero_width_rejected() {
        assert!(matches!(KeyLogChunker::new(0), Err(Error::Config(_))));
    }

    #[test]
    fn test_non_ascii_rejected() {
        let chunker = KeyLogChunker::new(2).unwrap();
        assert!(matches!(chunker.chunks("01é10"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_transform_log() {
        let log = "\
header line
KEY 2016-07-13 10:28
0000111122
noise
KEY
1010101\r
KEY
";
        let chunker = KeyLogChunker::new(3).unwrap();
        let mut out = Vec::new();
        let written = chunker.transform(Cursor::new(log), &mut out).unwrap();

        assert_eq!(written, 5);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "000\n011\n112\n101\n010\n"
        );
    }

    #[test]
    fn test_transform_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("SecretKey.log");
        let output = dir.path().join("keyDB.txt");
        std::fs::write(&input, format!("KEY\n{}\n", "01".repeat(10))).unwrap();

        let chunker = KeyLogChunker::new(5).unwrap();
        assert_eq!(chunker.transform_file(&input, &output).unwrap(), 3);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "01010\n10101\n01010\n"
        );
    }

    #[test]
    fn test_transform_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let chunker = KeyLogChunker::default();
        let result = chunker.transform_file(&dir.path().join("absent.log"), &dir.path().join("out.txt"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    proptest! {
        #[test]
        fn prop_chunks_are_exact_prefixes(bits in "[01]{0,200}", width in 1usize..40) {
            let chunker = KeyLogChunker::new(width).unwrap();
            let keys = chunker.chunks(&bits).unwrap();

            prop_assert!(keys.iter().all(|k| k.len() == width));
            prop_assert_eq!(keys.concat(), bits[..keys.len() * width].to_string());
            let remainder = bits.len() - keys.len() * width;
            prop_assert!(remainder <= width);
            prop_assert!(bits.len() <= width || remainder >= 1);
        }
    }
}
