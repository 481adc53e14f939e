//! Bus traffic printing.

use saslink::bridge::BusWord;

const WIDTH: usize = 0x10;

/// One printed line of bus characters. Characters with the ninth bit
/// set are marked with a `'`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Line<'a> {
    offset: usize,
    words: &'a [BusWord],
}

impl<'a> std::fmt::Display for Line<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}", self.offset)?;

        for (i, word) in self.words.iter().enumerate() {
            if i % 8 == 0 {
                write!(f, " ")?;
            }
            let mark = if word.ninth_bit { '\'' } else { ' ' };
            write!(f, " {:02x}{}", word.data, mark)?;
        }

        Ok(())
    }
}

pub fn lines(words: &[BusWord]) -> impl Iterator<Item = Line<'_>> {
    words
        .chunks(WIDTH)
        .enumerate()
        .map(|(i, words)| Line {
            offset: i * WIDTH,
            words,
        })
}

pub fn dump_prefix(prefix: &str, words: &[BusWord]) {
    for line in lines(words) {
        println!("{}{}", prefix, line);
    }
}

/// Print plain bytes, as seen after framing.
pub fn dump_bytes(prefix: &str, bytes: &[u8]) {
    let words: Vec<BusWord> = bytes.iter().map(|&b| BusWord::new(b, false)).collect();
    dump_prefix(prefix, &words);
}
