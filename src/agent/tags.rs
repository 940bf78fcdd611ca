//! autonomous 策略的标签语法解析
//!
//! 文法（防御式：缺失或畸形的块静默忽略，绝不让一次解析失败中断回合）：
//! - `<thinking>…</thinking>`：非贪婪取内部文本，`.` 匹配换行
//! - `<tasks>` 块内每行 `- [x] 名称` / `- [ ] 名称`，x 为已完成；
//!   名称里的括号状态说明（如 `（已完成）`）被剥除；序号取匹配行的 1 基索引
//! - 终止哨兵：字面量 `[ANALYSIS_COMPLETE]`

use std::sync::OnceLock;

use regex::Regex;

use crate::state::{Task, TaskStatus};

const COMPLETE_SENTINEL: &str = "[ANALYSIS_COMPLETE]";

fn thinking_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<thinking>(.*?)</thinking>").expect("thinking regex"))
}

fn tasks_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tasks>(.*?)</tasks>").expect("tasks regex"))
}

fn item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^-\s*\[(x| )\]\s*(.+)$").expect("item regex"))
}

fn paren_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[（(][^（）()]*[)）]").expect("paren regex"))
}

/// 提取思考块内文本
pub fn parse_thinking(content: &str) -> Option<String> {
    thinking_re()
        .captures(content)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// 提取任务块；没有块或块内无合法行时返回 None
pub fn parse_tasks(content: &str) -> Option<Vec<Task>> {
    let block = tasks_re().captures(content)?;
    let mut tasks = Vec::new();
    for line in block[1].trim().lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(item) = item_re().captures(line) else {
            continue;
        };
        let completed = item[1].eq_ignore_ascii_case("x");
        let name = paren_re().replace_all(item[2].trim(), "").trim().to_string();
        if name.is_empty() {
            continue;
        }
        let mut task = Task::new(tasks.len() as u32 + 1, name);
        task.status = if completed {
            TaskStatus::Completed
        } else {
            TaskStatus::Pending
        };
        tasks.push(task);
    }
    if tasks.is_empty() {
        None
    } else {
        Some(tasks)
    }
}

/// 渲染任务块（与 parse_tasks 构成往返）
pub fn render_tasks(tasks: &[Task]) -> String {
    let mut out = String::from("<tasks>\n");
    for t in tasks {
        let mark = if t.status == TaskStatus::Completed {
            'x'
        } else {
            ' '
        };
        out.push_str(&format!("- [{}] {}\n", mark, t.name));
    }
    out.push_str("</tasks>");
    out
}

/// 是否包含终止哨兵
pub fn is_complete(content: &str) -> bool {
    content.contains(COMPLETE_SENTINEL)
}

/// 剥掉标签与哨兵，得到报告正文
pub fn strip_report(content: &str) -> String {
    let without_thinking = thinking_re().replace_all(content, "");
    let without_tasks = tasks_re().replace_all(&without_thinking, "");
    let without_sentinel = without_tasks.replace(COMPLETE_SENTINEL, "");
    let trimmed = without_sentinel.trim();
    // 报告末尾的孤立分隔线一并去掉
    trimmed
        .strip_suffix("---")
        .map(|s| s.trim_end())
        .unwrap_or(trimmed)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_statuses_with_cjk_parenthetical() {
        let content = "<tasks>\n- [x] A\n- [ ] B （进行中）\n</tasks>";
        let tasks = parse_tasks(content).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, 1);
        assert_eq!(tasks[0].name, "A");
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[1].id, 2);
        assert_eq!(tasks[1].name, "B");
        assert_eq!(tasks[1].status, TaskStatus::Pending);
    }

    #[test]
    fn test_parse_ascii_parenthetical_stripped() {
        let tasks = parse_tasks("<tasks>\n- [x] 数据探索 (done)\n</tasks>").unwrap();
        assert_eq!(tasks[0].name, "数据探索");
    }

    #[test]
    fn test_round_trip() {
        let mut a = Task::new(1, "数据探索");
        a.status = TaskStatus::Completed;
        let b = Task::new(2, "趋势分析");
        let original = vec![a, b];
        let parsed = parse_tasks(&render_tasks(&original)).unwrap();
        assert_eq!(parsed.len(), original.len());
        for (p, o) in parsed.iter().zip(&original) {
            assert_eq!(p.id, o.id);
            assert_eq!(p.name, o.name);
            assert_eq!(p.status, o.status);
        }
    }

    #[test]
    fn test_missing_block_is_none() {
        assert!(parse_tasks("没有任务块的普通回复").is_none());
        assert!(parse_thinking("没有思考块").is_none());
    }

    #[test]
    fn test_malformed_block_ignored() {
        // 起始标签没有闭合：不 panic、不产出任务
        assert!(parse_tasks("<tasks>\n- [x] A\n").is_none());
        // 块内没有合法行
        assert!(parse_tasks("<tasks>\n随便写点什么\n</tasks>").is_none());
    }

    #[test]
    fn test_thinking_multiline() {
        let t = parse_thinking("<thinking>第一行\n第二行</thinking>其它").unwrap();
        assert_eq!(t, "第一行\n第二行");
    }

    #[test]
    fn test_sentinel_and_report_stripping() {
        let content = "<thinking>收尾</thinking>\n<tasks>\n- [x] A\n</tasks>\n# 报告\n正文\n---\n[ANALYSIS_COMPLETE]";
        assert!(is_complete(content));
        let report = strip_report(content);
        assert!(report.starts_with("# 报告"));
        assert!(!report.contains("ANALYSIS_COMPLETE"));
        assert!(!report.contains("<tasks>"));
        assert!(!report.ends_with("---"));
    }

    #[test]
    fn test_uppercase_x_accepted() {
        let tasks = parse_tasks("<tasks>\n- [X] A\n</tasks>").unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    }
}
