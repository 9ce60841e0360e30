//! ANSI to HTML conversion
//!
//! Process logs frequently carry SGR colour codes. These are turned into
//! inline-styled `<span>` elements; all other escape sequences and control
//! bytes are dropped and the remaining text is HTML-escaped.

use std::fmt::Write;
use std::sync::LazyLock;

use regex::Regex;

/// Separator placed between converted lines
pub const LINE_BREAK: &str = "<br/>";

/// CSI sequences, OSC sequences and any other two-byte escape
static ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[([0-9;:?]*)([@-~])|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?|\x1b[@-_]?")
        .expect("escape pattern is valid")
});

const PALETTE: [&str; 16] = [
    "#000", "#A00", "#0A0", "#A50", "#00A", "#A0A", "#0AA", "#AAA", "#555", "#F55", "#5F5",
    "#FF5", "#55F", "#F5F", "#5FF", "#FFF",
];

const DEFAULT_FG: &str = "#FFF";
const DEFAULT_BG: &str = "#000";

/// Current SGR rendition
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Style {
    fg: Option<String>,
    bg: Option<String>,
    bold: bool,
    dim: bool,
    italic: bool,
    underline: bool,
    strike: bool,
    inverse: bool,
}

impl Style {
    fn is_plain(&self) -> bool {
        *self == Self::default()
    }

    fn css(&self) -> String {
        let (fg, bg) = if self.inverse {
            (
                Some(self.bg.clone().unwrap_or_else(|| DEFAULT_BG.to_string())),
                Some(self.fg.clone().unwrap_or_else(|| DEFAULT_FG.to_string())),
            )
        } else {
            (self.fg.clone(), self.bg.clone())
        };

        let mut rules = Vec::new();
        if let Some(fg) = fg {
            rules.push(format!("color:{}", fg));
        }
        if let Some(bg) = bg {
            rules.push(format!("background-color:{}", bg));
        }
        if self.bold {
            rules.push("font-weight:bold".to_string());
        }
        if self.dim {
            rules.push("opacity:0.5".to_string());
        }
        if self.italic {
            rules.push("font-style:italic".to_string());
        }
        match (self.underline, self.strike) {
            (true, true) => rules.push("text-decoration:underline line-through".to_string()),
            (true, false) => rules.push("text-decoration:underline".to_string()),
            (false, true) => rules.push("text-decoration:line-through".to_string()),
            (false, false) => {}
        }
        rules.join(";")
    }

    /// Apply one SGR parameter list
    fn apply(&mut self, params: &str) {
        let codes: Vec<u32> = if params.is_empty() {
            vec![0]
        } else {
            params
                .split([';', ':'])
                .map(|p| p.parse().unwrap_or(0))
                .collect()
        };

        let mut iter = codes.into_iter();
        while let Some(code) = iter.next() {
            match code {
                0 => *self = Self::default(),
                1 => self.bold = true,
                2 => self.dim = true,
                3 => self.italic = true,
                4 => self.underline = true,
                7 => self.inverse = true,
                9 => self.strike = true,
                21 | 22 => {
                    self.bold = false;
                    self.dim = false;
                }
                23 => self.italic = false,
                24 => self.underline = false,
                27 => self.inverse = false,
                29 => self.strike = false,
                30..=37 => self.fg = Some(PALETTE[(code - 30) as usize].to_string()),
                38 => self.fg = extended_color(&mut iter),
                39 => self.fg = None,
                40..=47 => self.bg = Some(PALETTE[(code - 40) as usize].to_string()),
                48 => self.bg = extended_color(&mut iter),
                49 => self.bg = None,
                90..=97 => self.fg = Some(PALETTE[(code - 90 + 8) as usize].to_string()),
                100..=107 => self.bg = Some(PALETTE[(code - 100 + 8) as usize].to_string()),
                _ => {}
            }
        }
    }
}

/// Parse the tail of a `38`/`48` sequence (`5;n` or `2;r;g;b`)
fn extended_color(iter: &mut impl Iterator<Item = u32>) -> Option<String> {
    match iter.next()? {
        5 => iter.next().map(xterm_256),
        2 => {
            let r = iter.next()?.min(255);
            let g = iter.next()?.min(255);
            let b = iter.next()?.min(255);
            Some(format!("#{:02x}{:02x}{:02x}", r, g, b))
        }
        _ => None,
    }
}

fn xterm_256(index: u32) -> String {
    match index {
        0..=15 => PALETTE[index as usize].to_string(),
        16..=231 => {
            const LEVELS: [u32; 6] = [0, 95, 135, 175, 215, 255];
            let i = index - 16;
            let r = LEVELS[(i / 36) as usize];
            let g = LEVELS[((i / 6) % 6) as usize];
            let b = LEVELS[(i % 6) as usize];
            format!("#{:02x}{:02x}{:02x}", r, g, b)
        }
        232..=255 => {
            let level = 8 + (index - 232) * 10;
            format!("#{:02x}{:02x}{:02x}", level, level, level)
        }
        _ => DEFAULT_FG.to_string(),
    }
}

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '\t' => out.push('\t'),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
}

/// Convert one line of terminal output into HTML
pub fn ansi_to_html(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut style = Style::default();
    let mut span_open = false;
    let mut last = 0;

    for caps in ESCAPE.captures_iter(line) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        push_escaped(&mut out, &line[last..whole.start()]);
        last = whole.end();

        // Only SGR (`ESC [ ... m`) changes rendition
        if caps.get(2).map(|m| m.as_str()) != Some("m") {
            continue;
        }
        let params = caps.get(1).map_or("", |m| m.as_str());
        let before = style.clone();
        style.apply(params);
        if style == before {
            continue;
        }

        if span_open {
            out.push_str("</span>");
            span_open = false;
        }
        if !style.is_plain() {
            let _ = write!(out, "<span style=\"{}\">", style.css());
            span_open = true;
        }
    }

    push_escaped(&mut out, &line[last..]);
    if span_open {
        out.push_str("</span>");
    }
    out
}

/// Convert a batch of lines and join them with `<br/>`
pub fn render_lines<S: AsRef<str>>(lines: &[S]) -> String {
    lines
        .iter()
        .map(|line| ansi_to_html(line.as_ref()))
        .collect::<Vec<_>>()
        .join(LINE_BREAK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_escaped() {
        assert_eq!(
            ansi_to_html(r#"<script>alert("x") & 'y'</script>"#),
            "&lt;script&gt;alert(&quot;x&quot;) &amp; &#39;y&#39;&lt;/script&gt;"
        );
    }

    #[test]
    fn test_foreground_color() {
        assert_eq!(
            ansi_to_html("\x1b[31mError\x1b[0m done"),
            "<span style=\"color:#A00\">Error</span> done"
        );
    }

    #[test]
    fn test_combined_attributes() {
        assert_eq!(
            ansi_to_html("\x1b[1;4;92mok"),
            "<span style=\"color:#5F5;font-weight:bold;text-decoration:underline\">ok</span>"
        );
    }

    #[test]
    fn test_style_change_reopens_span() {
        assert_eq!(
            ansi_to_html("\x1b[32mgreen\x1b[34mblue\x1b[m"),
            "<span style=\"color:#0A0\">green</span><span style=\"color:#00A\">blue</span>"
        );
    }

    #[test]
    fn test_extended_colors() {
        assert_eq!(
            ansi_to_html("\x1b[38;5;196mred"),
            "<span style=\"color:#ff0000\">red</span>"
        );
        assert_eq!(
            ansi_to_html("\x1b[48;2;16;32;48mbg"),
            "<span style=\"background-color:#102030\">bg</span>"
        );
        assert_eq!(
            ansi_to_html("\x1b[38;5;232mgray"),
            "<span style=\"color:#080808\">gray</span>"
        );
    }

    #[test]
    fn test_inverse_uses_defaults() {
        assert_eq!(
            ansi_to_html("\x1b[7mrev"),
            "<span style=\"color:#000;background-color:#FFF\">rev</span>"
        );
    }

    #[test]
    fn test_non_sgr_sequences_dropped() {
        assert_eq!(ansi_to_html("\x1b[2K\x1b[1Gprogress 50%"), "progress 50%");
        assert_eq!(ansi_to_html("\x1b]0;title\x07text"), "text");
        assert_eq!(ansi_to_html("bell\x07 and\x08 back"), "bell and back");
    }

    #[test]
    fn test_redundant_reset_emits_no_span() {
        assert_eq!(ansi_to_html("\x1b[0mplain\x1b[0m"), "plain");
    }

    #[test]
    fn test_render_lines_joins_with_break() {
        let lines = vec!["one".to_string(), "\x1b[33mtwo\x1b[0m".to_string()];
        assert_eq!(
            render_lines(&lines),
            "one<br/><span style=\"color:#A50\">two</span>"
        );
    }

    #[test]
    fn test_multibyte_text_preserved() {
        assert_eq!(ansi_to_html("\x1b[36m─ ok ─\x1b[0m"), "<span style=\"color:#0AA\">─ ok ─</span>");
    }
}
