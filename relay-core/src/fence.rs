//! Safe-display transformation for partially streamed markdown.
//!
//! A snapshot cut mid-generation often ends inside a code block or inline
//! code span, which most chat surfaces render as garbage (or reject). The
//! balancer closes whatever region is still open so the partial text renders
//! the way the finished text will.
//!
//! Recognised delimiters are runs of backticks: three or more open a fenced
//! block (with an optional language tag up to end of line), one or two open
//! an inline span. Regions never nest. Inside a block only a run at least as
//! long as the opener closes it; inside a span only a run of exactly the
//! opener's length does. Everything is recomputed over the full text on each
//! call, so a delimiter split across fragments is seen whole.

use std::borrow::Cow;

const FENCE_MIN_TICKS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    Block,
    Inline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRegion {
    pub kind: FenceKind,
    /// Length of the opening backtick run.
    pub ticks: usize,
    /// Byte offset of the opening run.
    pub opened_at: usize,
    /// Language tag captured from a block opener.
    pub lang: Option<String>,
}

/// Returns the region still open at the end of `text`, if any.
pub fn unclosed_region(text: &str) -> Option<OpenRegion> {
    let bytes = text.as_bytes();
    let mut open: Option<OpenRegion> = None;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'`' {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i] == b'`' {
            i += 1;
        }
        let run = i - start;

        match open.as_ref() {
            None if run >= FENCE_MIN_TICKS => {
                open = Some(OpenRegion {
                    kind: FenceKind::Block,
                    ticks: run,
                    opened_at: start,
                    // Backticks are ASCII, so `i` sits on a char boundary.
                    lang: info_tag(&text[i..]),
                });
            }
            None => {
                open = Some(OpenRegion {
                    kind: FenceKind::Inline,
                    ticks: run,
                    opened_at: start,
                    lang: None,
                });
            }
            Some(region) => {
                let closes = match region.kind {
                    FenceKind::Block => run >= region.ticks,
                    FenceKind::Inline => run == region.ticks,
                };
                if closes {
                    open = None;
                }
            }
        }
    }

    open
}

/// Closes any region left open at the end of `text`.
///
/// Balanced input comes back borrowed and unchanged.
pub fn balance(text: &str) -> Cow<'_, str> {
    let Some(region) = unclosed_region(text) else {
        return Cow::Borrowed(text);
    };

    let mut out = String::with_capacity(text.len() + region.ticks + 2);
    out.push_str(text);
    match region.kind {
        FenceKind::Block => {
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        FenceKind::Inline => {
            // Keep the closer from merging into a trailing run.
            if out.ends_with('`') {
                out.push(' ');
            }
        }
    }
    out.extend(std::iter::repeat_n('`', region.ticks));
    Cow::Owned(out)
}

fn info_tag(rest: &str) -> Option<String> {
    let line = rest.split('\n').next().unwrap_or_default();
    line.split_whitespace().next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closes_block_opened_mid_line() {
        assert_eq!(
            balance("abc ```py\ndef f():"),
            "abc ```py\ndef f():\n```"
        );
    }

    #[test]
    fn block_close_omits_language_tag() {
        let region = unclosed_region("```rust\nfn main() {").expect("open block");
        assert_eq!(region.kind, FenceKind::Block);
        assert_eq!(region.lang.as_deref(), Some("rust"));
        assert_eq!(balance("```rust\nfn main() {"), "```rust\nfn main() {\n```");
    }

    #[test]
    fn block_ending_in_newline_gets_no_extra_blank_line() {
        assert_eq!(balance("```\nx\n"), "```\nx\n```");
    }

    #[test]
    fn longer_opener_needs_longer_closer() {
        let text = "````md\n```inner\n";
        let region = unclosed_region(text).expect("outer still open");
        assert_eq!(region.ticks, 4);
        assert_eq!(balance(text), "````md\n```inner\n````");
    }

    #[test]
    fn closes_inline_span() {
        assert_eq!(balance("run `cargo"), "run `cargo`");
        assert_eq!(balance("run ``a`b"), "run ``a`b``");
    }

    #[test]
    fn dangling_inline_opener_does_not_merge_with_closer() {
        let out = balance("see `");
        assert_eq!(out, "see ` `");
        assert!(unclosed_region(&out).is_none());
    }

    #[test]
    fn single_backtick_inside_block_is_literal() {
        let text = "```sh\necho `date`\n";
        assert_eq!(
            unclosed_region(text).map(|r| r.kind),
            Some(FenceKind::Block)
        );
        assert_eq!(balance(text), "```sh\necho `date`\n```");
    }

    #[test]
    fn triple_run_inside_inline_span_does_not_nest() {
        let text = "a `b ``` c";
        let region = unclosed_region(text).expect("span still open");
        assert_eq!(region.kind, FenceKind::Inline);
        assert!(unclosed_region(&balance(text)).is_none());
    }

    #[test]
    fn balanced_text_is_borrowed_unchanged() {
        let text = "plain `code` and\n```\nblock\n```\ndone";
        assert!(matches!(balance(text), Cow::Borrowed(_)));
        assert_eq!(balance(text), text);
    }

    #[test]
    fn delimiter_split_across_fragments_is_seen_whole() {
        let mut acc = String::new();
        for fragment in ["intro `", "``js\nlet", " x = 1;\n`", "``\nafter"] {
            acc.push_str(fragment);
            assert!(unclosed_region(&balance(&acc)).is_none());
        }
        assert!(unclosed_region(&acc).is_none());
    }

    #[test]
    fn balance_is_idempotent_and_leaves_nothing_open() {
        let cases = [
            "",
            "`",
            "``",
            "```",
            "````",
            "x ```",
            "x ```py",
            "`a``",
            "```\n``",
            "```\na\n``",
            "héllo `wörld",
            "```py\nprint('ü')\n```\nand `more",
            "a `b` c `d",
        ];
        for case in cases {
            let once = balance(case).into_owned();
            assert!(
                unclosed_region(&once).is_none(),
                "still open after balance: {case:?} -> {once:?}"
            );
            assert_eq!(balance(&once), once, "not idempotent for {case:?}");
            assert!(once.starts_with(case));
        }
    }
}
