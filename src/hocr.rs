//! Render engine output as hOCR.
//!
//! hOCR is XHTML with OCR metadata in `class` and `title` attributes. We emit
//! only `ocr_page` and `ocr_line` elements. The output contains no timestamps
//! or other varying data, so the same input always renders to the same bytes.

use crate::engines::{BBox, RawResult};

const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.0 Transitional//EN" "http://www.w3.org/TR/xhtml1/DTD/xhtml1-transitional.dtd">
<html xmlns="http://www.w3.org/1999/xhtml" xml:lang="en" lang="en">
 <head>
  <title></title>
  <meta http-equiv="Content-Type" content="text/html;charset=utf-8"/>
  <meta name="ocr-system" content="ocr-dispatch"/>
  <meta name="ocr-capabilities" content="ocr_page ocr_line"/>
 </head>
 <body>
"#;

const FOOTER: &str = " </body>\n</html>\n";

/// Render `raw` as an hOCR document.
pub fn render(raw: &RawResult) -> String {
    let mut out = String::from(HEADER);
    for (page_idx, page) in raw.pages.iter().enumerate() {
        let page_no = page_idx + 1;
        let mut title = String::new();
        if let Some((width, height)) = page.size {
            title.push_str(&format!("bbox 0 0 {width} {height}; "));
        }
        title.push_str(&format!("ppageno {page_idx}"));
        out.push_str(&format!(
            "  <div class=\"ocr_page\" id=\"page_{page_no}\" title=\"{title}\">\n"
        ));

        for (line_idx, line) in page.lines.iter().enumerate() {
            let mut attrs = vec![];
            if let Some(bbox) = line.bbox {
                attrs.push(bbox_attr(bbox));
            }
            if let Some(confidence) = line.confidence {
                attrs.push(format!("x_wconf {}", confidence.clamp(0.0, 100.0).round()));
            }
            let title = if attrs.is_empty() {
                String::new()
            } else {
                format!(" title=\"{}\"", attrs.join("; "))
            };
            out.push_str(&format!(
                "   <span class=\"ocr_line\" id=\"line_{page_no}_{}\"{title}>{}</span>\n",
                line_idx + 1,
                escape(&line.text),
            ));
        }
        out.push_str("  </div>\n");
    }
    out.push_str(FOOTER);
    out
}

fn bbox_attr(bbox: BBox) -> String {
    format!(
        "bbox {} {} {} {}",
        bbox.left, bbox.top, bbox.right, bbox.bottom
    )
}

/// Escape text for XML content.
fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            // Not allowed in XML 1.0 at all.
            c if c.is_control() && !matches!(c, '\t' | '\n' | '\r') => {}
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{RawLine, RawPage};

    fn sample() -> RawResult {
        RawResult {
            pages: vec![RawPage {
                size: Some((800, 600)),
                lines: vec![
                    RawLine {
                        text: "Fish & <chips>".to_owned(),
                        bbox: Some(BBox {
                            left: 1,
                            top: 2,
                            right: 3,
                            bottom: 4,
                        }),
                        confidence: Some(93.6),
                    },
                    RawLine {
                        text: "plain".to_owned(),
                        bbox: None,
                        confidence: None,
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_render_escapes_and_annotates() {
        let hocr = render(&sample());
        assert!(hocr.contains(
            r#"<div class="ocr_page" id="page_1" title="bbox 0 0 800 600; ppageno 0">"#
        ));
        assert!(hocr.contains(
            r#"<span class="ocr_line" id="line_1_1" title="bbox 1 2 3 4; x_wconf 94">Fish &amp; &lt;chips&gt;</span>"#
        ));
        assert!(hocr.contains(r#"<span class="ocr_line" id="line_1_2">plain</span>"#));
        assert!(hocr.ends_with("</html>\n"));
    }

    #[test]
    fn test_render_is_deterministic() {
        assert_eq!(render(&sample()), render(&sample()));
    }

    #[test]
    fn test_empty_result_is_still_a_document() {
        let hocr = render(&RawResult::default());
        assert!(hocr.starts_with("<?xml"));
        assert!(!hocr.contains("ocr_page\""));
    }
}
