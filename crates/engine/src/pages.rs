//! Page counting from a rendered artifact.
//!
//! The scanner walks the PDF token stream instead of grepping bytes: string
//! literals, hex strings, comments and stream bodies are skipped, so text
//! that merely spells `/Type /Page` never counts as a page.

/// Count the page objects in a PDF artifact.
///
/// Returns `None` when no page object is found (not a PDF, or an encoding
/// this scanner does not understand); callers decide the fallback.
pub fn count_pages(bytes: &[u8]) -> Option<u32> {
    let mut scanner = Scanner { bytes, pos: 0 };
    let mut count: u32 = 0;
    let mut prev_was_type = false;
    let mut pending_length: Option<usize> = None;
    let mut prev_was_length = false;

    while let Some(token) = scanner.next_token() {
        match token {
            Token::Name(name) => {
                if prev_was_type && name == b"Page" {
                    count = count.saturating_add(1);
                }
                prev_was_type = name == b"Type";
                prev_was_length = name == b"Length";
            }
            Token::Word(word) => {
                if prev_was_length {
                    pending_length = std::str::from_utf8(word).ok().and_then(|w| w.parse().ok());
                } else if word == b"obj" {
                    pending_length = None;
                } else if word == b"stream" {
                    scanner.skip_stream_body(pending_length.take());
                }
                prev_was_type = false;
                prev_was_length = false;
            }
            Token::Other => {
                prev_was_type = false;
                prev_was_length = false;
            }
        }
    }
    (count > 0).then_some(count)
}

enum Token<'a> {
    Name(&'a [u8]),
    Word(&'a [u8]),
    Other,
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'\x0C' | b'\0')
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%')
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next_token(&mut self) -> Option<Token<'a>> {
        while self.peek().is_some_and(is_whitespace) {
            self.pos += 1;
        }
        let b = self.peek()?;
        match b {
            b'%' => {
                while self.peek().is_some_and(|c| c != b'\n' && c != b'\r') {
                    self.pos += 1;
                }
                Some(Token::Other)
            }
            b'(' => {
                self.skip_literal_string();
                Some(Token::Other)
            }
            b'<' if self.bytes.get(self.pos + 1) == Some(&b'<') => {
                self.pos += 2;
                Some(Token::Other)
            }
            b'>' if self.bytes.get(self.pos + 1) == Some(&b'>') => {
                self.pos += 2;
                Some(Token::Other)
            }
            b'<' => {
                while self.peek().is_some_and(|c| c != b'>') {
                    self.pos += 1;
                }
                self.pos += 1;
                Some(Token::Other)
            }
            b'/' => {
                self.pos += 1;
                let start = self.pos;
                self.skip_regular();
                Some(Token::Name(&self.bytes[start..self.pos]))
            }
            _ if is_delimiter(b) => {
                self.pos += 1;
                Some(Token::Other)
            }
            _ => {
                let start = self.pos;
                self.skip_regular();
                Some(Token::Word(&self.bytes[start..self.pos]))
            }
        }
    }

    fn skip_regular(&mut self) {
        while self.peek().is_some_and(|c| !is_whitespace(c) && !is_delimiter(c)) {
            self.pos += 1;
        }
    }

    fn skip_literal_string(&mut self) {
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                b'\\' => self.pos += 1,
                b'(' => depth += 1,
                b')' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    /// Jump past `endstream`, trusting `/Length` when it lands on the keyword.
    fn skip_stream_body(&mut self, length: Option<usize>) {
        if self.peek() == Some(b'\r') {
            self.pos += 1;
        }
        if self.peek() == Some(b'\n') {
            self.pos += 1;
        }
        let body_start = self.pos;

        if let Some(len) = length {
            let mut end = body_start.saturating_add(len);
            while self.bytes.get(end).copied().is_some_and(is_whitespace) {
                end += 1;
            }
            if self.bytes[end.min(self.bytes.len())..].starts_with(b"endstream") {
                self.pos = end + b"endstream".len();
                return;
            }
        }

        let rest = &self.bytes[body_start.min(self.bytes.len())..];
        self.pos = match rest.windows(b"endstream".len()).position(|w| w == b"endstream") {
            Some(at) => body_start + at + b"endstream".len(),
            None => self.bytes.len(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_page_tree_nodes() {
        let pdf = b"<< /Type /Pages /Count 2 >> << /Type /Page >> << /Type/Page >>";
        assert_eq!(count_pages(pdf), Some(2));
    }

    #[test]
    fn unknown_content_has_no_count() {
        assert_eq!(count_pages(b"plain bytes"), None);
        assert_eq!(count_pages(b""), None);
    }

    #[test]
    fn page_markers_inside_strings_and_streams_are_not_pages() {
        let body = "BT (/Type /Page) Tj ET";
        let pdf = format!(
            "%PDF-1.4\n% /Type /Page\n\
             1 0 obj\n<< /Title (a \\) /Type /Page) /Alt <2F54797065> >>\nendobj\n\
             2 0 obj\n<< /Type /Page /Contents 3 0 R >>\nendobj\n\
             3 0 obj\n<< /Length {} >>\nstream\n{body}\nendstream\nendobj\n",
            body.len()
        );
        assert_eq!(count_pages(pdf.as_bytes()), Some(1));
    }

    #[test]
    fn stream_without_usable_length_is_skipped_to_endstream() {
        let pdf = b"1 0 obj\n<< /Length 999 >>\nstream\n/Type /Page\nendstream\nendobj\n\
                    2 0 obj\n<< /Type /Page >>\nendobj\n";
        assert_eq!(count_pages(pdf), Some(1));
    }
}
