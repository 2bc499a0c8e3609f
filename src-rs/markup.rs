use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::{NoExpand, Regex};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const CENTER_STYLE: &str = "display: block; margin-left: auto; margin-right: auto;";
const ROUND_STYLE: &str = "border-radius: 8px;";
const CAPTION_OPEN: &str = r#"<div style="text-align: center; margin-top: 10px;"><b><i>"#;
const CAPTION_CLOSE: &str = "</i></b></div>";

/// A width or height attribute value: pixels, or the literal `auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dimension {
    Px(u32),
    #[default]
    Auto,
}

impl Dimension {
    /// Pixel value rounded from a float; anything non-positive is `auto`.
    pub fn from_f64(value: f64) -> Self {
        if value.is_finite() && value >= 0.5 {
            Dimension::Px(value.round().min(f64::from(u32::MAX)) as u32)
        } else {
            Dimension::Auto
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Px(v) => write!(f, "{v}"),
            Dimension::Auto => f.write_str("auto"),
        }
    }
}

impl FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return Ok(Dimension::Auto);
        }
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Dimension::from_f64)
            .ok_or_else(|| format!("expected a number or \"auto\", got {trimmed:?}"))
    }
}

impl Serialize for Dimension {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Dimension::Px(v) => serializer.serialize_u32(*v),
            Dimension::Auto => serializer.serialize_str("auto"),
        }
    }
}

impl<'de> Deserialize<'de> for Dimension {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
            Missing(()),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(v) => Ok(Dimension::from_f64(v)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Missing(()) => Ok(Dimension::Auto),
        }
    }
}

/// Everything needed to render one image tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMarkup {
    pub src: String,
    pub width: Dimension,
    pub height: Dimension,
    pub center: bool,
    pub round_corners: bool,
    pub caption: Option<String>,
}

impl ImageMarkup {
    pub fn style(&self) -> Option<String> {
        let mut decls = Vec::with_capacity(2);
        if self.center {
            decls.push(CENTER_STYLE);
        }
        if self.round_corners {
            decls.push(ROUND_STYLE);
        }
        if decls.is_empty() {
            None
        } else {
            Some(decls.join(" "))
        }
    }

    /// The self-closing `<img>` tag, followed by the caption block on its own
    /// line when a non-empty caption is set.
    pub fn render(&self) -> String {
        let mut out = format!(
            r#"<img src="{}" width="{}" height="{}""#,
            self.src, self.width, self.height
        );
        if let Some(style) = self.style() {
            out.push_str(&format!(r#" style="{style}""#));
        }
        out.push_str(" />");

        if let Some(caption) = self.caption.as_deref().filter(|c| !c.trim().is_empty()) {
            out.push('\n');
            out.push_str(&caption_block(caption));
        }
        out
    }
}

pub fn caption_block(caption: &str) -> String {
    // Folded to one line so the replacement pattern can find it again.
    let single_line = caption.split(['\r', '\n']).collect::<Vec<_>>().join(" ");
    format!("{CAPTION_OPEN}{}{CAPTION_CLOSE}", escape_html(&single_line))
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(ch),
        }
    }
    out
}

fn img_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<img.*?>").expect("static regex"))
}

fn img_src_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<img[^>]*src=["']([^"']*)["'][^>]*>"#).expect("static regex")
    })
}

pub fn has_image(text: &str) -> bool {
    img_tag_re().is_match(text)
}

/// `src` values of every `<img>` tag in document order, without repeats.
pub fn image_sources(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in img_src_re().captures_iter(text) {
        let src = caps[1].to_string();
        if !out.contains(&src) {
            out.push(src);
        }
    }
    out
}

/// Matches the tag whose `src` is exactly `relative_path`, plus the caption
/// block this tool writes right after it, if present.
pub fn replacement_pattern(relative_path: &str) -> Regex {
    let pattern = format!(
        r#"<img[^>]*src=["']{}["'][^>]*>(?:\r?\n<div style="text-align: center;[^"]*">.*?</div>)?"#,
        regex::escape(relative_path)
    );
    Regex::new(&pattern).expect("escaped path always forms a valid regex")
}

/// Replaces the first tag for `relative_path` with `markup`. Returns the text
/// unchanged when the path does not appear.
pub fn replace_image(text: &str, relative_path: &str, markup: &str) -> String {
    replacement_pattern(relative_path)
        .replacen(text, 1, NoExpand(markup))
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markup(width: Dimension, height: Dimension, center: bool, round: bool) -> ImageMarkup {
        ImageMarkup {
            src: "images/cat.png".to_string(),
            width,
            height,
            center,
            round_corners: round,
            caption: None,
        }
    }

    #[test]
    fn centered_tag_matches_expected_text() {
        let tag = markup(Dimension::Px(340), Dimension::Px(200), true, false).render();
        assert_eq!(
            tag,
            r#"<img src="images/cat.png" width="340" height="200" style="display: block; margin-left: auto; margin-right: auto;" />"#
        );
    }

    #[test]
    fn style_declarations_compose_independently() {
        let both = markup(Dimension::Auto, Dimension::Auto, true, true);
        assert_eq!(
            both.style().as_deref(),
            Some("display: block; margin-left: auto; margin-right: auto; border-radius: 8px;")
        );
        let round = markup(Dimension::Auto, Dimension::Auto, false, true);
        assert_eq!(round.style().as_deref(), Some("border-radius: 8px;"));
    }

    #[test]
    fn style_attribute_omitted_without_options() {
        let tag = markup(Dimension::Auto, Dimension::Px(90), false, false).render();
        assert_eq!(tag, r#"<img src="images/cat.png" width="auto" height="90" />"#);
    }

    #[test]
    fn caption_escapes_every_special_character() {
        let mut m = markup(Dimension::Px(10), Dimension::Px(10), false, false);
        m.caption = Some(r#"<b>&"'"#.to_string());
        let rendered = m.render();
        let caption_line = rendered.lines().nth(1).unwrap();
        assert!(caption_line.contains("&lt;b&gt;&amp;&quot;&#039;"));
        assert!(!caption_line.contains("<b>&"));
    }

    #[test]
    fn blank_caption_is_skipped() {
        let mut m = markup(Dimension::Px(10), Dimension::Px(10), false, false);
        m.caption = Some("   ".to_string());
        assert!(!m.render().contains('\n'));
    }

    #[test]
    fn dimension_parses_cli_and_json_forms() {
        assert_eq!("auto".parse::<Dimension>(), Ok(Dimension::Auto));
        assert_eq!("".parse::<Dimension>(), Ok(Dimension::Auto));
        assert_eq!(" 120 ".parse::<Dimension>(), Ok(Dimension::Px(120)));
        assert!("wide".parse::<Dimension>().is_err());
        assert!("inf".parse::<Dimension>().is_err());

        let from_num: Dimension = serde_json::from_str("340").unwrap();
        assert_eq!(from_num, Dimension::Px(340));
        let from_str: Dimension = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(from_str, Dimension::Auto);
        assert_eq!(serde_json::to_string(&Dimension::Px(5)).unwrap(), "5");
    }

    #[test]
    fn non_positive_sizes_mean_auto_in_every_form() {
        for text in ["0", "-5", "0.2"] {
            assert_eq!(text.parse::<Dimension>(), Ok(Dimension::Auto), "{text}");
            let quoted: Dimension = serde_json::from_str(&format!("\"{text}\"")).unwrap();
            assert_eq!(quoted, Dimension::Auto, "{text}");
            let number: Dimension = serde_json::from_str(text).unwrap();
            assert_eq!(number, Dimension::Auto, "{text}");
        }
    }

    #[test]
    fn sources_are_listed_once_in_order() {
        let text = r#"<img src="images/a.png" />
<img width="3" src='images/b.png'>
<img src="images/a.png" />"#;
        assert_eq!(image_sources(text), vec!["images/a.png", "images/b.png"]);
        assert!(has_image(text));
        assert!(!has_image("# heading"));
    }

    #[test]
    fn replace_swaps_tag_and_caption() {
        let old = "intro\n<img src=\"images/cat.png\" width=\"10\" height=\"10\" />\n<div style=\"text-align: center;\">Old</div>\ntail";
        let new_tag = markup(Dimension::Px(20), Dimension::Px(20), false, false).render();
        let replaced = replace_image(old, "images/cat.png", &new_tag);
        assert_eq!(replaced, format!("intro\n{new_tag}\ntail"));
    }

    #[test]
    fn replace_without_match_is_noop() {
        let text = "<img src=\"images/dog.png\" width=\"1\" height=\"1\" />";
        assert_eq!(replace_image(text, "images/cat.png", "<img />"), text);
    }

    #[test]
    fn replace_treats_dollar_signs_literally() {
        let text = "<img src=\"images/cat.png\" />";
        let mut m = markup(Dimension::Px(1), Dimension::Px(1), false, false);
        m.caption = Some("costs $1".to_string());
        let tag = m.render();
        assert_eq!(replace_image(text, "images/cat.png", &tag), tag);
    }

    #[test]
    fn path_metacharacters_are_escaped() {
        let text = "<img src=\"images/a+b.png\" />";
        assert_eq!(replace_image(text, "images/aab.png", "X"), text);
        assert_eq!(replace_image(text, "images/a+b.png", "X"), "X");
    }
}
