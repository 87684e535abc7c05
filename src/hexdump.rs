//! This module contains the hex formatter used to render captured buffers
//!
//! The output layout is the classic analyst dump: an offset column, sixteen
//! hex byte cells per row, and an ASCII gutter. Rendering is a pure function
//! of the input bytes and options, so identical calls always produce
//! byte-identical strings.

use std::fmt::Write;

/// Green SGR escape used for printable bytes when colorized output is requested
const GREEN: &str = "\x1b[32m";
/// SGR reset escape
const RESET: &str = "\x1b[0m";
/// Bytes rendered per row
const ROW_LEN: usize = 16;

/// Rendering options for [`hexdump`]
#[derive(Debug, Clone)]
pub struct HexdumpOptions {
    /// Index of the first byte of the display window; also the first row's
    /// displayed offset
    pub offset: usize,
    /// Number of bytes to display, `None` for the rest of the buffer.
    /// The window is truncated to the bytes actually provided.
    pub length: Option<usize>,
    /// Emit the column-label line above the first row
    pub header: bool,
    /// Embed terminal color escapes around printable bytes
    pub ansi: bool,
}

impl Default for HexdumpOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            length: None,
            header: true,
            ansi: false,
        }
    }
}

/// Renders `bytes` as a hex dump according to `options`.
///
/// An empty display window renders as the header line alone, or as an empty
/// string when the header is disabled. The final row is padded with blank
/// cells so the ASCII gutter stays aligned.
pub fn hexdump(bytes: &[u8], options: &HexdumpOptions) -> String {
    let start = options.offset.min(bytes.len());
    let window = &bytes[start..];
    let window = match options.length {
        Some(length) => &window[..length.min(window.len())],
        None => window,
    };

    let mut lines = Vec::with_capacity(window.len() / ROW_LEN + 2);
    if options.header {
        lines.push(header_line());
    }
    for (row, chunk) in window.chunks(ROW_LEN).enumerate() {
        lines.push(row_line(options.offset + row * ROW_LEN, chunk, options.ansi));
    }
    lines.join("\n")
}

/// Builds the column-label line: blanks over the offset column, one label per
/// hex cell, and an ASCII ruler over the gutter
fn header_line() -> String {
    let mut line = String::with_capacity(80);
    line.push_str("          ");
    for col in 0..ROW_LEN {
        if col > 0 {
            line.push(' ');
        }
        // the label sits over the low nibble of its cell
        let _ = write!(line, "{:>2x}", col);
    }
    line.push_str("  0123456789abcdef");
    line
}

/// Renders one row: offset column, hex cells (blank-padded past the end of
/// `chunk`), and the ASCII gutter
fn row_line(offset: usize, chunk: &[u8], ansi: bool) -> String {
    let mut line = String::with_capacity(96);
    let _ = write!(line, "{:08x}  ", offset);
    for col in 0..ROW_LEN {
        if col > 0 {
            line.push(' ');
        }
        match chunk.get(col) {
            Some(&byte) => push_cell(&mut line, byte, ansi),
            None => line.push_str("  "),
        }
    }
    line.push_str("  ");
    for &byte in chunk {
        push_gutter(&mut line, byte, ansi);
    }
    line
}

/// True for bytes rendered verbatim in the ASCII gutter
fn is_printable(byte: u8) -> bool {
    (0x20..=0x7e).contains(&byte)
}

/// Appends one two-digit hex cell, colorized when requested and printable
fn push_cell(line: &mut String, byte: u8, ansi: bool) {
    if ansi && is_printable(byte) {
        let _ = write!(line, "{}{:02x}{}", GREEN, byte, RESET);
    } else {
        let _ = write!(line, "{:02x}", byte);
    }
}

/// Appends one ASCII gutter character, colorized when requested and printable
fn push_gutter(line: &mut String, byte: u8, ansi: bool) {
    if is_printable(byte) {
        if ansi {
            let _ = write!(line, "{}{}{}", GREEN, byte as char, RESET);
        } else {
            line.push(byte as char);
        }
    } else {
        line.push('.');
    }
}

#[cfg(test)]
mod tests {
    use super::{hexdump, HexdumpOptions};

    /// Options used by the illustrative plaintext dump: full window, header,
    /// no color
    fn plain() -> HexdumpOptions {
        HexdumpOptions {
            offset: 0,
            length: None,
            header: true,
            ansi: false,
        }
    }

    #[test]
    /// A full 16-byte row renders with the exact header, cell, and gutter layout
    fn test_single_row() {
        let bytes = b"cwc_encrypt\x00\x00\x00\x00\x00";
        let expected = concat!(
            "           0  1  2  3  4  5  6  7  8  9  a  b  c  d  e  f  0123456789abcdef",
            "\n",
            "00000000  63 77 63 5f 65 6e 63 72 79 70 74 00 00 00 00 00  cwc_encrypt....."
        );
        assert_eq!(hexdump(bytes, &plain()), expected);
    }

    #[test]
    /// A short final row pads its hex cells so the gutter stays aligned
    fn test_partial_row_padding() {
        let mut bytes = b"0123456789abcdef".to_vec();
        bytes.push(0x01);
        let options = HexdumpOptions {
            header: false,
            ..plain()
        };
        let expected = format!(
            "00000000  30 31 32 33 34 35 36 37 38 39 61 62 63 64 65 66  0123456789abcdef\n\
             00000010  01{}  .",
            " ".repeat(45)
        );
        assert_eq!(hexdump(&bytes, &options), expected);
    }

    #[test]
    /// The offset option skips leading bytes and shifts the displayed offsets
    fn test_offset_window() {
        let bytes = [0u8, 1, 2, 3, 4, 5, 6, 7];
        let options = HexdumpOptions {
            offset: 4,
            header: false,
            ..plain()
        };
        let expected = format!("00000004  04 05 06 07{}  ....", " ".repeat(36));
        assert_eq!(hexdump(&bytes, &options), expected);
    }

    #[test]
    /// The length option truncates the window and never reads past the buffer
    fn test_length_truncates() {
        let bytes = [0x41u8; 64];
        let options = HexdumpOptions {
            length: Some(16),
            header: false,
            ..plain()
        };
        let rendered = hexdump(&bytes, &options);
        assert_eq!(rendered.lines().count(), 1);

        // asking for more than the buffer holds shows only what exists
        let options = HexdumpOptions {
            length: Some(100),
            header: false,
            ..plain()
        };
        let rendered = hexdump(&bytes[..3], &options);
        assert!(rendered.starts_with("00000000  41 41 41 "));
        assert!(rendered.ends_with("  AAA"));
    }

    #[test]
    /// An empty window renders as the header alone, or nothing without it
    fn test_empty_buffer() {
        let header_only = hexdump(&[], &plain());
        assert_eq!(header_only.lines().count(), 1);
        assert!(header_only.ends_with("0123456789abcdef"));

        let options = HexdumpOptions {
            header: false,
            ..plain()
        };
        assert_eq!(hexdump(&[], &options), "");

        // a window starting past the end of the buffer is empty too
        let options = HexdumpOptions {
            offset: 10,
            header: false,
            ..plain()
        };
        assert_eq!(hexdump(&[1, 2, 3], &options), "");
    }

    #[test]
    /// Identical input always renders to byte-identical output
    fn test_deterministic() {
        let bytes: Vec<u8> = (0..=255).collect();
        let first = hexdump(&bytes, &plain());
        let second = hexdump(&bytes, &plain());
        assert_eq!(first, second);
    }

    #[test]
    /// Color escapes appear only when requested, and only on printable bytes
    fn test_ansi_escapes() {
        let bytes = [b'A', 0x00];
        assert!(!hexdump(&bytes, &plain()).contains('\x1b'));

        let options = HexdumpOptions {
            ansi: true,
            header: false,
            ..plain()
        };
        let rendered = hexdump(&bytes, &options);
        let expected = format!(
            "00000000  \x1b[32m41\x1b[0m 00{}  \x1b[32mA\x1b[0m.",
            " ".repeat(42)
        );
        assert_eq!(rendered, expected);
    }
}
