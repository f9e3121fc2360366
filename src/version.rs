//! Debian version ordering (`deb-version(5)`): `[epoch:]upstream-version[-revision]`.
//!
//! `cmp` is the comparator the Reconciler uses to decide new/upgrade/downgrade/collision;
//! `comparable_key` is a byte-string transform of the same ordering, materialized once per
//! Package Record so SQL `ORDER BY` and in-memory sorts can both use plain lexical compare
//! instead of shipping the comparator itself around.

use std::cmp::Ordering;

/// Split `epoch:upstream-revision` into its three parts. Missing epoch is `0`;
/// missing revision is `""`, which compares as though it were `"0"`.
fn split(version: &str) -> (u64, &str, &str) {
    let (epoch, rest) = match version.split_once(':') {
        Some((e, rest)) => (e.parse().unwrap_or(0), rest),
        None => (0, version),
    };
    match rest.rsplit_once('-') {
        Some((upstream, revision)) => (epoch, upstream, revision),
        None => (epoch, rest, ""),
    }
}

/// Order value of a character for the non-digit comparison phase: `~` is lowest,
/// running off the end of a non-digit run (including hitting a digit, or the true
/// end of the segment) is the neutral middle value, letters sort by ASCII before
/// any other punctuation, which sorts past `Z`/`z`.
fn order(ch: Option<u8>) -> i32 {
    match ch {
        Some(b'~') => -1,
        None => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(c) => c as i32 + 256,
    }
}

fn is_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

/// The classic `dpkg` `verrevcmp` walk: alternate a character-wise non-digit
/// comparison with a numeric digit-run comparison until both strings are exhausted.
fn compare_segment(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut ai, mut bi) = (0usize, 0usize);
    loop {
        while (ai < a.len() && !is_digit(a[ai])) || (bi < b.len() && !is_digit(b[bi])) {
            let ca = if ai < a.len() { Some(a[ai]) } else { None };
            let cb = if bi < b.len() { Some(b[bi]) } else { None };
            match order(ca).cmp(&order(cb)) {
                Ordering::Equal => {}
                v => return v,
            }
            if ai < a.len() && !is_digit(a[ai]) {
                ai += 1;
            }
            if bi < b.len() && !is_digit(b[bi]) {
                bi += 1;
            }
        }
        while a.get(ai) == Some(&b'0') {
            ai += 1;
        }
        while b.get(bi) == Some(&b'0') {
            bi += 1;
        }
        let start_a = ai;
        while ai < a.len() && is_digit(a[ai]) {
            ai += 1;
        }
        let start_b = bi;
        while bi < b.len() && is_digit(b[bi]) {
            bi += 1;
        }
        match (ai - start_a).cmp(&(bi - start_b)) {
            Ordering::Equal => {}
            v => return v,
        }
        match a[start_a..ai].cmp(&b[start_b..bi]) {
            Ordering::Equal => {}
            v => return v,
        }
        if ai >= a.len() && bi >= b.len() {
            return Ordering::Equal;
        }
    }
}

/// Total order over two Debian version strings: -1, 0, or +1.
pub fn cmp(a: &str, b: &str) -> i32 {
    let (ea, ua, ra) = split(a);
    let (eb, ub, rb) = split(b);
    match ea.cmp(&eb) {
        Ordering::Equal => {}
        Ordering::Less => return -1,
        Ordering::Greater => return 1,
    }
    match compare_segment(ua, ub) {
        Ordering::Equal => {}
        Ordering::Less => return -1,
        Ordering::Greater => return 1,
    }
    match compare_segment(ra, rb) {
        Ordering::Equal => 0,
        Ordering::Less => -1,
        Ordering::Greater => 1,
    }
}

/// Transform a version into a byte string whose lexical order matches `cmp`.
///
/// Mirrors `compare_segment`'s alternation directly: every maximal non-digit run is
/// encoded character-by-character using the same `order` ranks and closed with an
/// explicit sentinel (so "ran into a digit" and "ran off the end" compare equal, as
/// `cmp` requires), then a digit run, if present, is encoded length-prefixed so equal
/// lexical and numeric order agree.
pub fn comparable_key(version: &str) -> Vec<u8> {
    let (epoch, upstream, revision) = split(version);
    let mut out = Vec::with_capacity(version.len() * 3 + 32);
    out.extend(format!("{epoch:020}").into_bytes());
    out.push(0);
    encode_segment(upstream, &mut out);
    out.push(0);
    encode_segment(revision, &mut out);
    out
}

fn push_token(out: &mut Vec<u8>, value: i32) {
    out.push(b'T');
    out.extend(((value + 1) as u16).to_be_bytes());
}

fn encode_segment(segment: &str, out: &mut Vec<u8>) {
    let bytes = segment.as_bytes();
    let mut i = 0;
    loop {
        while i < bytes.len() && !is_digit(bytes[i]) {
            push_token(out, order(Some(bytes[i])));
            i += 1;
        }
        push_token(out, order(None));
        if i >= bytes.len() {
            return;
        }
        let start = i;
        while i < bytes.len() && is_digit(bytes[i]) {
            i += 1;
        }
        let digits = std::str::from_utf8(&bytes[start..i])
            .unwrap()
            .trim_start_matches('0');
        out.push(b'D');
        out.extend((digits.len() as u32).to_be_bytes());
        out.extend(digits.as_bytes());
        if i >= bytes.len() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(a: &str, b: &str, expect: i32) {
        assert_eq!(cmp(a, b), expect, "cmp({a:?}, {b:?})");
        assert_eq!(cmp(b, a), -expect, "cmp({b:?}, {a:?})");
    }

    #[test]
    fn equal_versions() {
        check("1.0", "1.0", 0);
        check("1.0-1", "1.0-1", 0);
    }

    #[test]
    fn simple_upstream_ordering() {
        check("1.0", "1.2", -1);
        check("1.2", "1.0", 1);
    }

    #[test]
    fn missing_epoch_is_zero() {
        check("0:1.0", "1.0", 0);
        check("1:1.0", "1.0", 1);
    }

    #[test]
    fn tilde_sorts_before_everything() {
        check("1.0~rc1", "1.0", -1);
        check("1.0~~", "1.0~", -1);
        check("1.0~", "1.0", -1);
    }

    #[test]
    fn shorter_is_less_than_continuation_without_tilde() {
        check("1.0", "1.0.1", -1);
        check("1.0", "1.0a", -1);
    }

    #[test]
    fn missing_revision_is_zero() {
        check("1.0", "1.0-0", 0);
        check("1.0-1", "1.0", 1);
    }

    #[test]
    fn leading_zeroes_do_not_affect_numeric_order() {
        check("1.007", "1.7", 0);
        check("1.010", "1.9", 1);
    }

    #[test]
    fn comparable_key_is_monotone_with_cmp() {
        let samples = [
            "1.0", "1.1", "1.0-1", "1.0-2", "0:1.2", "1:0.1", "1.0+dfsg1", "1.0~dfsg1",
            "1.0~rc1", "2.0", "10.0", "2.0~~1", "1.0.1", "1.007", "1.7",
        ];
        for a in samples {
            for b in samples {
                let by_cmp = cmp(a, b).signum();
                let by_key = comparable_key(a).cmp(&comparable_key(b)) as i32;
                assert_eq!(
                    by_cmp, by_key,
                    "cmp({a:?},{b:?})={by_cmp} but key order={by_key}"
                );
            }
        }
    }

    #[test]
    fn sorts_match_dpkg_reference_order() {
        let mut versions = vec![
            "1.3", "1.0", "1.0+dfsg1-1", "1.0-1", "1.1", "0:1.2", "1:0.1", "1.0+dfsg1",
            "1.0~dfsg1",
        ];
        versions.sort_by(|a, b| match cmp(a, b) {
            v if v < 0 => Ordering::Less,
            v if v > 0 => Ordering::Greater,
            _ => Ordering::Equal,
        });
        assert_eq!(
            versions,
            vec![
                "1.0~dfsg1",
                "1.0",
                "1.0-1",
                "1.0+dfsg1",
                "1.0+dfsg1-1",
                "1.1",
                "0:1.2",
                "1.3",
                "1:0.1",
            ]
        );
    }
}
