//! Character-level diff engine.
//!
//! Turns two text snapshots into an ordered script of insert/delete
//! operations and replays those operations against a text. All positions and
//! lengths count Unicode scalar values (`char`s), never bytes, so a script
//! computed on the server replays identically on any client that indexes text
//! the same way.
//!
//! The edit script is produced with Myers' O(ND) algorithm after trimming the
//! common prefix and suffix. Scripts are ordered: every op assumes all
//! previous ops of the same script were already applied.

use serde::{Deserialize, Serialize};

/// Past this many edits the search gives up on minimality and replaces the
/// whole changed region. Bounds memory at O(limit^2).
const MAX_EDIT_DISTANCE: usize = 1000;

/// Kind of an edit operation, encoded on the wire as `1` (add) / `-1` (remove).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Operation {
    Insert,
    Delete,
}

impl TryFrom<i8> for Operation {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Operation::Insert),
            -1 => Ok(Operation::Delete),
            other => Err(format!("unknown operation type: {}", other)),
        }
    }
}

impl From<Operation> for i8 {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Insert => 1,
            Operation::Delete => -1,
        }
    }
}

/// One atomic change to a text stream.
///
/// `text` is kept for deletes too, so an op can be replayed or audited
/// without the text it was computed against. `len` always equals the number
/// of chars in `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOp {
    #[serde(rename = "type")]
    pub kind: Operation,
    pub position: usize,
    pub text: String,
    pub len: usize,
}

impl EditOp {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind: Operation::Insert,
            position,
            len: text.chars().count(),
            text,
        }
    }

    pub fn delete(position: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind: Operation::Delete,
            position,
            len: text.chars().count(),
            text,
        }
    }

    /// Whether `len` agrees with `text`.
    pub fn is_consistent(&self) -> bool {
        self.len == self.text.chars().count()
    }
}

/// An ordered edit script.
pub type EditScript = Vec<EditOp>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal,
    Insert,
    Delete,
}

/// Compute the edit script turning `old` into `new`.
///
/// Positions are offsets into the target text reached so far: inserts
/// advance the running offset, deletes do not, equal runs advance it without
/// emitting anything. Within a changed region deletes come before inserts.
pub fn compute_diff(old: &str, new: &str) -> EditScript {
    if old == new {
        return Vec::new();
    }

    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];

    let edits = myers(a_mid, b_mid).unwrap_or_else(|| {
        let mut edits = vec![Edit::Delete; a_mid.len()];
        edits.extend(std::iter::repeat(Edit::Insert).take(b_mid.len()));
        edits
    });

    let mut script = Vec::new();
    let mut idx = prefix;
    let (mut ai, mut bi) = (0, 0);
    let mut deleted = String::new();
    let mut inserted = String::new();

    for edit in edits {
        match edit {
            Edit::Equal => {
                flush(&mut script, &mut idx, &mut deleted, &mut inserted);
                idx += 1;
                ai += 1;
                bi += 1;
            }
            Edit::Delete => {
                deleted.push(a_mid[ai]);
                ai += 1;
            }
            Edit::Insert => {
                inserted.push(b_mid[bi]);
                bi += 1;
            }
        }
    }
    flush(&mut script, &mut idx, &mut deleted, &mut inserted);

    script
}

fn flush(script: &mut EditScript, idx: &mut usize, deleted: &mut String, inserted: &mut String) {
    if !deleted.is_empty() {
        script.push(EditOp::delete(*idx, std::mem::take(deleted)));
    }
    if !inserted.is_empty() {
        let op = EditOp::insert(*idx, std::mem::take(inserted));
        *idx += op.len;
        script.push(op);
    }
}

/// Shortest edit path between `a` and `b`, one entry per char.
///
/// Returns `None` when the edit distance exceeds [`MAX_EDIT_DISTANCE`].
fn myers(a: &[char], b: &[char]) -> Option<Vec<Edit>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let limit = (a.len() + b.len()).min(MAX_EDIT_DISTANCE) as isize;
    let offset = limit + 1;

    let mut v = vec![0isize; (2 * offset + 1) as usize];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    let mut found = None;
    'search: for d in 0..=limit {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                found = Some(d);
                break 'search;
            }
            k += 2;
        }
    }
    found?;

    let mut edits = Vec::with_capacity(a.len() + b.len());
    let (mut x, mut y) = (n, m);
    for (d, v) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let k = x - y;
        let idx = (k + offset) as usize;
        let prev_k = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[(prev_k + offset) as usize];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            edits.push(Edit::Equal);
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                edits.push(Edit::Insert);
            } else {
                edits.push(Edit::Delete);
            }
        }
        x = prev_x;
        y = prev_y;
    }

    edits.reverse();
    Some(edits)
}

/// Apply a single op to `text`.
///
/// Total on any input: positions past the end are clamped to the end and
/// deletes running past the end remove only the available suffix. An insert
/// at position zero prepends.
pub fn apply_diff(text: &str, op: &EditOp) -> String {
    match op.kind {
        Operation::Insert => {
            if text.is_empty() {
                return op.text.clone();
            }
            let at = byte_offset(text, op.position);
            let mut out = String::with_capacity(text.len() + op.text.len());
            out.push_str(&text[..at]);
            out.push_str(&op.text);
            out.push_str(&text[at..]);
            out
        }
        Operation::Delete => {
            if text.is_empty() {
                return String::new();
            }
            let start = byte_offset(text, op.position);
            let end = start + byte_offset(&text[start..], op.len);
            let mut out = String::with_capacity(text.len() - (end - start));
            out.push_str(&text[..start]);
            out.push_str(&text[end..]);
            out
        }
    }
}

/// Fold a whole script over `text`, left to right.
pub fn apply_script(text: &str, script: &[EditOp]) -> String {
    script
        .iter()
        .fold(text.to_string(), |acc, op| apply_diff(&acc, op))
}

/// Byte offset of the `chars`-th char, clamped to the end of `text`.
fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}
