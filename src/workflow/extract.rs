//! 页面快照的内容抽取与元素定位
//!
//! 两类确定性启发式：
//! - 正文抽取：按序尝试称呼语标记匹配，全部落空时退回「前 N 行有意义文本」；
//!   快照本身为空才算抽取失败。
//! - 元素定位：具名启发式按固定顺序评估（定位符精确关键词 → 大纲模糊关键词
//!   → 位置兜底），取第一个命中。

use std::collections::HashMap;

use regex::Regex;

use crate::bridge::DomSnapshot;
use crate::error::{Error, Result};

/// 正文抽取保留的最大行数
const MAX_FALLBACK_LINES: usize = 20;
/// 短于此长度的行视为噪音
const MIN_MEANINGFUL_LEN: usize = 10;

const GREETINGS: [&str; 3] = ["Dear", "Hello", "Hi"];
const SIGNATURES: [&str; 3] = ["Best regards", "Sincerely", "Thanks"];

/// 从快照大纲中抽取邮件正文
///
/// 顺序：称呼语起点 + 签名 / 空行终点；否则前 N 行有意义文本。
/// 只有快照为空时返回 `Error::Extraction`。
pub fn extract_email_content(outline: &str) -> Result<String> {
    if outline.trim().is_empty() {
        return Err(Error::Extraction("Snapshot text is empty".to_string()));
    }

    if let Some(span) = greeting_span(outline) {
        if span.trim().len() >= MIN_MEANINGFUL_LEN {
            return Ok(span.trim().to_string());
        }
    }

    let fallback: Vec<&str> = outline
        .lines()
        .map(str::trim)
        .filter(|line| line.len() > MIN_MEANINGFUL_LEN)
        .take(MAX_FALLBACK_LINES)
        .collect();
    if !fallback.is_empty() {
        return Ok(fallback.join("\n"));
    }

    // 快照非空但全是噪音行：退回原文截断而不是空串
    Ok(outline.trim().chars().take(1000).collect())
}

/// 称呼语到签名行尾（或首个空行、或文本结尾）的片段
fn greeting_span(outline: &str) -> Option<String> {
    let start = GREETINGS
        .iter()
        .filter_map(|g| {
            Regex::new(&format!(r"(?i)\b{}\b", g))
                .ok()?
                .find(outline)
                .map(|m| m.start())
        })
        .min()?;

    let rest = &outline[start..];
    let mut end = rest.len();

    if let Some(gap) = rest.find("\n\n") {
        end = end.min(gap);
    }
    for marker in SIGNATURES {
        if let Some(pos) = rest.find(marker) {
            // 含签名所在行
            let line_end = rest[pos..].find('\n').map(|n| pos + n).unwrap_or(rest.len());
            end = end.min(line_end);
        }
    }

    Some(rest[..end].to_string())
}

/// 定位结果：元素 id 与命中的启发式名
pub type Located = (String, &'static str);

/// 回复界面的关键元素
#[derive(Debug, Default)]
pub struct EmailElements {
    pub reply_button: Option<Located>,
    pub text_area: Option<Located>,
    pub send_button: Option<Located>,
}

/// 按数字序稳定遍历定位符映射
fn sorted_entries(map: &HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by_key(|(id, _)| id.parse::<u64>().unwrap_or(u64::MAX));
    entries
}

fn exact_keyword(
    map: &HashMap<String, String>,
    topic_words: &[&str],
    kind_words: &[&str],
) -> Option<Located> {
    for (id, xpath) in sorted_entries(map) {
        let xpath = xpath.to_lowercase();
        if topic_words.iter().any(|w| xpath.contains(w))
            && kind_words.iter().any(|w| xpath.contains(w))
        {
            return Some((id.clone(), "exact-keyword"));
        }
    }
    None
}

fn fuzzy_keyword(outline: &str, topic: &str) -> Option<Located> {
    let re = Regex::new(&format!(r"(?i)(\d+)[^\n]*(?:{})", topic)).ok()?;
    re.captures(outline)
        .map(|cap| (cap[1].to_string(), "fuzzy-keyword"))
}

fn positional(map: &HashMap<String, String>, kind_words: &[&str]) -> Option<Located> {
    for (id, xpath) in sorted_entries(map) {
        let xpath = xpath.to_lowercase();
        if kind_words.iter().any(|w| xpath.contains(w)) {
            return Some((id.clone(), "positional"));
        }
    }
    None
}

/// 在快照中定位回复按钮、输入区与发送按钮
///
/// 发送按钮只用于避让（绝不点击），定位它是为了确认没把它当成回复按钮。
pub fn find_email_elements(snapshot: &DomSnapshot) -> EmailElements {
    let map = &snapshot.highlight_to_xpath;
    let outline = &snapshot.processed_output;

    let reply_button = exact_keyword(map, &["reply", "respond", "compose"], &["button", "click"])
        .or_else(|| fuzzy_keyword(outline, "reply"))
        .or_else(|| positional(map, &["button"]));

    let text_area = exact_keyword(
        map,
        &["textarea", "message", "body", "content", "response"],
        &["input", "textarea"],
    )
    .or_else(|| fuzzy_keyword(outline, "textarea|text area"))
    .or_else(|| positional(map, &["textarea", "input"]));

    let send_button = exact_keyword(map, &["send", "submit"], &["button"]);

    EmailElements {
        reply_button,
        text_area,
        send_button,
    }
}

/// 在收件箱快照中找可点击的邮件链接（最多 10 条）
pub fn find_email_links(snapshot: &DomSnapshot) -> Vec<String> {
    let mut links = Vec::new();
    for (id, xpath) in sorted_entries(&snapshot.highlight_to_xpath) {
        let xpath = xpath.to_lowercase();
        let topical = ["mail", "message", "subject", "inbox"]
            .iter()
            .any(|w| xpath.contains(w));
        let linkish = xpath.contains("/a") || xpath.contains("link");
        if topical && linkish {
            links.push(id.clone());
        }
        if links.len() >= 10 {
            break;
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slate_snapshot() -> DomSnapshot {
        DomSnapshot {
            processed_output: "Page Structure:\n\
                1. Email Subject: \"Question about MS Robotics Program\"\n\
                2. Reply Button (Click to respond)\n\
                3. Email Body: \"Dear Admissions, I have questions about the MS in Robotics program. Best regards, John Smith\"\n\
                4. Text Area: (For composing response)\n\
                5. Send Button\n\
                6. Back to Inbox"
                .to_string(),
            highlight_to_xpath: [
                ("1", "/html/body/div[@class='email-subject']"),
                ("2", "/html/body/button[@id='reply-btn']"),
                ("3", "/html/body/div[@class='email-content']"),
                ("4", "/html/body/textarea[@id='response-text']"),
                ("5", "/html/body/button[@id='send-btn']"),
                ("6", "/html/body/a[@class='back-link']"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            html: String::new(),
        }
    }

    #[test]
    fn test_greeting_extraction() {
        let content = extract_email_content(&slate_snapshot().processed_output).unwrap();
        assert!(content.starts_with("Dear Admissions"));
        assert!(content.contains("Best regards"));
    }

    #[test]
    fn test_fallback_to_meaningful_lines() {
        let outline = "Page Elements:\n1. Navigation Menu\n2. Main Content Area\nok\n3. Search Box";
        let content = extract_email_content(outline).unwrap();
        assert!(!content.is_empty());
        assert!(content.contains("Navigation Menu"));
        assert!(!content.contains("\nok\n"), "short lines filtered");
    }

    #[test]
    fn test_empty_snapshot_is_extraction_failure() {
        assert!(matches!(
            extract_email_content("   \n "),
            Err(Error::Extraction(_))
        ));
    }

    #[test]
    fn test_element_ranking_on_slate_page() {
        let elements = find_email_elements(&slate_snapshot());
        assert_eq!(elements.reply_button.as_ref().unwrap().0, "2");
        assert_eq!(elements.reply_button.as_ref().unwrap().1, "exact-keyword");
        assert_eq!(elements.text_area.as_ref().unwrap().0, "4");
        assert_eq!(elements.send_button.as_ref().unwrap().0, "5");
    }

    #[test]
    fn test_fuzzy_fallback_without_xpath_hints() {
        let snapshot = DomSnapshot {
            processed_output: "1. Subject line\n2. Reply to sender\n3. Compose box".to_string(),
            highlight_to_xpath: HashMap::new(),
            html: String::new(),
        };
        let elements = find_email_elements(&snapshot);
        let (id, heuristic) = elements.reply_button.unwrap();
        assert_eq!(id, "2");
        assert_eq!(heuristic, "fuzzy-keyword");
    }

    #[test]
    fn test_inbox_link_discovery() {
        let snapshot = DomSnapshot {
            processed_output: String::new(),
            highlight_to_xpath: [
                ("1", "/html/body/a[@class='inbox-message']"),
                ("2", "/html/body/button[@id='refresh']"),
                ("3", "/html/body/a[@class='mail-subject-link']"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            html: String::new(),
        };
        assert_eq!(find_email_links(&snapshot), vec!["1", "3"]);
    }
}
