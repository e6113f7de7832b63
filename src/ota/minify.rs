// Source minimiser - drops comments, blank lines and triple-quoted blocks before upload
//
// Line oriented, not a parser: a triple quote inside a string literal (or an escaped
// one) can make it drop or keep the wrong lines.

const SINGLE_TRIPLE: &[u8] = b"'''";
const DOUBLE_TRIPLE: &[u8] = b"\"\"\"";

/// Strip comment lines, blank lines and triple-quoted blocks.
pub fn minimise(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut in_comment = false;

    for line in data.split(|b| *b == b'\n') {
        let rest = trim_start(line);

        if rest.first() == Some(&b'#') || rest.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        if is_single_line_block(rest) {
            continue;
        }
        if !in_comment && starts_with_triple(rest) {
            in_comment = true;
            continue;
        }
        if in_comment {
            if contains(line, SINGLE_TRIPLE) || contains(line, DOUBLE_TRIPLE) {
                in_comment = false;
            }
            continue;
        }

        result.extend_from_slice(line);
        result.push(b'\n');
    }

    result
}

fn trim_start(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    &line[start..]
}

fn starts_with_triple(rest: &[u8]) -> bool {
    rest.starts_with(SINGLE_TRIPLE) || rest.starts_with(DOUBLE_TRIPLE)
}

// A block opened and closed with the same quote kind on one line
fn is_single_line_block(rest: &[u8]) -> bool {
    [SINGLE_TRIPLE, DOUBLE_TRIPLE]
        .iter()
        .any(|quote| rest.starts_with(quote) && contains(&rest[quote.len()..], quote))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
