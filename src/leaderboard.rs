//! Renders the per-session lucky / unlucky leaderboard shown in the OBS text
//! source.

/// Rows shown per board; shorter boards are padded with placeholder rows.
pub const MAX_ROWS: usize = 5;

/// One viewer's aggregate session result, in battery units.
#[derive(Debug, Clone)]
pub struct LeaderboardEntry {
    pub uid: i64,
    pub name: String,
    pub battery: i64,
}

/// Build the two boards from per-viewer session batteries. Viewers with a
/// zero net battery appear on neither board.
pub fn render(entries: &[LeaderboardEntry]) -> String {
    let mut lucky: Vec<&LeaderboardEntry> = entries.iter().filter(|e| e.battery > 0).collect();
    let mut unlucky: Vec<&LeaderboardEntry> = entries.iter().filter(|e| e.battery < 0).collect();

    lucky.sort_by(|a, b| b.battery.cmp(&a.battery));
    unlucky.sort_by(|a, b| a.battery.cmp(&b.battery));
    lucky.truncate(MAX_ROWS);
    unlucky.truncate(MAX_ROWS);

    let mut out = String::new();

    out.push_str("本场盲盒幸运儿排行榜: \n");
    for i in 0..MAX_ROWS {
        match lucky.get(i) {
            Some(entry) => {
                out.push_str(&format!("{}. {}: +{} 电池\n", i + 1, entry.name, entry.battery))
            }
            None => out.push_str(&format!("{}. 暂无~\n", i + 1)),
        }
    }

    out.push_str("本场盲盒倒霉蛋排行榜: \n");
    for i in 0..MAX_ROWS {
        match unlucky.get(i) {
            Some(entry) => {
                out.push_str(&format!("{}. {}: {} 电池\n", i + 1, entry.name, entry.battery))
            }
            None => out.push_str(&format!("{}. 暂无~\n", i + 1)),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(uid: i64, name: &str, battery: i64) -> LeaderboardEntry {
        LeaderboardEntry {
            uid,
            name: name.to_string(),
            battery,
        }
    }

    #[test]
    fn test_empty_session_renders_placeholders() {
        let report = render(&[]);

        assert!(report.starts_with("本场盲盒幸运儿排行榜: \n"));
        assert!(report.contains("本场盲盒倒霉蛋排行榜: \n"));
        assert_eq!(report.matches("暂无~").count(), 10);
    }

    #[test]
    fn test_lucky_sorted_descending() {
        let entries = vec![entry(1, "a", 10), entry(2, "b", 30), entry(3, "c", 20)];
        let report = render(&entries);

        let b = report.find("b: +30").unwrap();
        let c = report.find("c: +20").unwrap();
        let a = report.find("a: +10").unwrap();
        assert!(b < c && c < a);
    }

    #[test]
    fn test_unlucky_sorted_ascending() {
        let entries = vec![entry(1, "a", -10), entry(2, "b", -30), entry(3, "c", -20)];
        let report = render(&entries);

        let b = report.find("b: -30").unwrap();
        let c = report.find("c: -20").unwrap();
        let a = report.find("a: -10").unwrap();
        assert!(b < c && c < a);
    }

    #[test]
    fn test_zero_battery_appears_on_neither_board() {
        let report = render(&[entry(1, "even", 0)]);

        assert!(!report.contains("even"));
        assert_eq!(report.matches("暂无~").count(), 10);
    }

    #[test]
    fn test_boards_truncate_to_five_rows() {
        let entries: Vec<LeaderboardEntry> = (1..=7)
            .map(|i| entry(i, &format!("user{}", i), i * 10))
            .collect();
        let report = render(&entries);

        // Top five only; the two smallest are cut.
        assert!(report.contains("user7: +70"));
        assert!(report.contains("user3: +30"));
        assert!(!report.contains("user2: +20"));
        assert!(!report.contains("user1: +10"));

        // Lucky board is full, unlucky board is all placeholders.
        assert_eq!(report.matches("暂无~").count(), 5);
    }

    #[test]
    fn test_row_numbering_runs_one_to_five_per_board() {
        let report = render(&[entry(1, "a", 5), entry(2, "b", -5)]);

        for i in 1..=5 {
            assert_eq!(report.matches(&format!("{}. ", i)).count(), 2);
        }
    }
}
