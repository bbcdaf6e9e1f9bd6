/// Literal delimiters some models wrap their reasoning in.
const REASONING_TAGS: [&str; 2] = ["<think>", "</think>"];

/// Remove reasoning delimiter tags, keeping the text between them.
///
/// Removal repeats until no tag remains, so input like `<th<think>ink>`
/// cannot reassemble a tag and the function is idempotent.
pub fn strip_reasoning_markup(text: &str) -> String {
    let mut out = text.to_owned();
    while let Some(tag) = REASONING_TAGS.iter().find(|tag| out.contains(**tag)) {
        out = out.replace(tag, "");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_unchanged() {
        assert_eq!(strip_reasoning_markup("Hello, world"), "Hello, world");
        assert_eq!(strip_reasoning_markup("a < b > c"), "a < b > c");
        assert_eq!(strip_reasoning_markup(""), "");
    }

    #[test]
    fn removes_both_tags() {
        assert_eq!(
            strip_reasoning_markup("<think>plan</think>Answer"),
            "planAnswer"
        );
        assert_eq!(strip_reasoning_markup("</think>"), "");
    }

    #[test]
    fn nested_fragments_cannot_reassemble() {
        assert_eq!(strip_reasoning_markup("<th<think>ink>x"), "x");
        assert_eq!(strip_reasoning_markup("<</think>/think>y"), "y");
    }

    #[test]
    fn idempotent() {
        let inputs = [
            "Hello",
            "<think>a</think>b",
            "<th<think>ink>",
            "<<think>/think>",
            "partial <thi",
            "</thi</think>nk>z",
        ];
        for input in inputs {
            let once = strip_reasoning_markup(input);
            assert_eq!(strip_reasoning_markup(&once), once, "input: {input}");
        }
    }
}
