use std::sync::OnceLock;

use regex_lite::Regex;

use crate::config::WindowMode;

fn csi_regex() -> &'static Regex {
    static CSI: OnceLock<Regex> = OnceLock::new();
    CSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[0-9A-Za-z]").expect("valid CSI pattern"))
}

/// Removes ANSI CSI sequences that programs emit past the multiplexer's own
/// rendering (colors, cursor jumps). The multiplexer already resolved the
/// screen contents; what is left here is noise in a chat code block.
pub fn strip_csi(input: &str) -> String {
    csi_regex().replace_all(input, "").into_owned()
}

/// Shapes a raw capture into the rendered window: `Trim` drops trailing
/// all-blank lines, `Full` pads or truncates to exactly `rows` lines.
/// Trailing whitespace per line is dropped in both modes.
pub fn window(capture: &str, mode: WindowMode, rows: u16) -> String {
    let mut lines: Vec<String> = capture
        .lines()
        .map(|line| line.trim_end().to_string())
        .collect();
    match mode {
        WindowMode::Trim => {
            while lines.last().is_some_and(|line| line.is_empty()) {
                lines.pop();
            }
        }
        WindowMode::Full => {
            lines.truncate(rows as usize);
            while lines.len() < rows as usize {
                lines.push(String::new());
            }
        }
    }
    lines.join("\n")
}

/// Breaks up backtick runs that would terminate the surrounding code block.
pub fn escape_backticks(input: &str) -> String {
    input.replace("```", "` ` `")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_and_cursor_sequences() {
        let raw = "\x1b[31mred\x1b[0m plain \x1b[2J\x1b[H";
        assert_eq!(strip_csi(raw), "red plain ");
    }

    #[test]
    fn keeps_text_without_sequences() {
        assert_eq!(strip_csi("$ echo hi\nhi"), "$ echo hi\nhi");
    }

    #[test]
    fn trim_drops_trailing_blank_lines() {
        let capture = "$ ls\nfile\n   \n\n\n";
        assert_eq!(window(capture, WindowMode::Trim, 15), "$ ls\nfile");
    }

    #[test]
    fn trim_of_blank_screen_is_empty() {
        assert_eq!(window("\n\n\n", WindowMode::Trim, 15), "");
    }

    #[test]
    fn full_pads_to_row_count() {
        let rendered = window("$ ls\nfile", WindowMode::Full, 4);
        assert_eq!(rendered, "$ ls\nfile\n\n");
        assert_eq!(rendered.lines().count() + 1, 4); // trailing blanks count as rows
    }

    #[test]
    fn full_truncates_overlong_captures() {
        let rendered = window("a\nb\nc\nd", WindowMode::Full, 2);
        assert_eq!(rendered, "a\nb");
    }

    #[test]
    fn backtick_fences_are_broken_up() {
        assert_eq!(escape_backticks("echo ```"), "echo ` ` `");
        assert_eq!(escape_backticks("no fences"), "no fences");
    }
}
