use regex::Regex;
use std::sync::OnceLock;

const IDENT: &str = r"(?:[0-9a-zA-Z$_.`-]|[\x{80}-\x{10FFFF}])+";

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // DML: the first table after FROM / INTO / UPDATE.
            format!(
                r"(?is)^\s*(?:SELECT.*?\s+FROM|INSERT(?:\s+LOW_PRIORITY|\s+DELAYED|\s+HIGH_PRIORITY)?(?:\s+IGNORE)?(?:\s+INTO)?|REPLACE(?:\s+LOW_PRIORITY|\s+DELAYED)?(?:\s+INTO)?|UPDATE(?:\s+LOW_PRIORITY)?(?:\s+IGNORE)?|DELETE(?:\s+LOW_PRIORITY|\s+QUICK|\s+IGNORE)*(?:.+?FROM)?)\s+({IDENT})"
            ),
            r#"(?is)^\s*SHOW\s+(?:TABLE\s+STATUS|(?:FULL\s+)?TABLES).+WHERE\s+Name\s*=\s*["']([0-9a-zA-Z$_.-]+)["']"#.to_string(),
            r#"(?is)^\s*SHOW\s+(?:TABLE\s+STATUS|(?:FULL\s+)?TABLES)\s+(?:WHERE\s+Name\s+)?LIKE\s*["']([\\0-9a-zA-Z$_.-]+)%?["']"#.to_string(),
            format!(
                r"(?is)^\s*(?:(?:TRUNCATE|OPTIMIZE|REPAIR|CHECK|CHECKSUM|ANALYZE)\s+TABLE|(?:CREATE|ALTER|DROP)\s+(?:TEMPORARY\s+)?TABLE(?:\s+IF\s+(?:NOT\s+)?EXISTS)?|LOCK\s+TABLES|DESCRIBE|DESC|EXPLAIN|SHOW\s+(?:FULL\s+)?(?:COLUMNS|FIELDS|INDEX|INDEXES|KEYS)\s+(?:FROM|IN)|SHOW\s+CREATE\s+TABLE)\s+({IDENT})"
            ),
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid table extraction regex"))
        .collect()
    })
}

fn strip_leading_noise(mut s: &str) -> &str {
    loop {
        let t = s.trim_start().trim_start_matches('(');
        if let Some(rest) = t.strip_prefix("/*") {
            if let Some(end) = rest.find("*/") {
                s = &rest[end + 2..];
                continue;
            }
        }
        return t;
    }
}

/// Name of the table `sql` reads or writes, without backticks or a
/// database qualifier. `None` when the statement names no table.
pub fn table_from_query(sql: &str) -> Option<String> {
    let sql = strip_leading_noise(sql);
    let raw = patterns()
        .iter()
        .find_map(|re| re.captures(sql).and_then(|c| c.get(1)))?
        .as_str();

    let unquoted = raw.replace('`', "").replace('\\', "");
    let table = unquoted.rsplit('.').next().unwrap_or_default().trim();
    (!table.is_empty()).then(|| table.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(sql: &str) -> Option<String> {
        table_from_query(sql)
    }

    #[test]
    fn dml_statements() {
        assert_eq!(table("SELECT * FROM wp_posts WHERE ID = 1").as_deref(), Some("wp_posts"));
        assert_eq!(table("select count(*) from `wp_options`").as_deref(), Some("wp_options"));
        assert_eq!(
            table("INSERT IGNORE INTO wp_postmeta (meta_key) VALUES ('a')").as_deref(),
            Some("wp_postmeta")
        );
        assert_eq!(table("REPLACE INTO wp_options VALUES (1)").as_deref(), Some("wp_options"));
        assert_eq!(table("UPDATE wp_users SET x = 1").as_deref(), Some("wp_users"));
        assert_eq!(table("DELETE FROM wp_comments WHERE 1").as_deref(), Some("wp_comments"));
        assert_eq!(
            table("SELECT p.ID FROM wordpress.wp_posts AS p").as_deref(),
            Some("wp_posts")
        );
    }

    #[test]
    fn leading_comments_and_parens() {
        assert_eq!(
            table("/* cache */ (SELECT ID FROM wp_posts) UNION (SELECT ID FROM wp_pages)").as_deref(),
            Some("wp_posts")
        );
    }

    #[test]
    fn show_and_ddl_statements() {
        assert_eq!(table("SHOW TABLES LIKE 'wp\\_posts'").as_deref(), Some("wp_posts"));
        assert_eq!(
            table("SHOW TABLE STATUS WHERE Name = 'wp_terms'").as_deref(),
            Some("wp_terms")
        );
        assert_eq!(
            table("CREATE TABLE IF NOT EXISTS wp_links (id int)").as_deref(),
            Some("wp_links")
        );
        assert_eq!(table("DROP TABLE `wp_5_posts`").as_deref(), Some("wp_5_posts"));
        assert_eq!(table("DESCRIBE wp_posts").as_deref(), Some("wp_posts"));
        assert_eq!(table("SHOW FULL COLUMNS FROM wp_posts").as_deref(), Some("wp_posts"));
        assert_eq!(table("TRUNCATE TABLE wp_options").as_deref(), Some("wp_options"));
    }

    #[test]
    fn statements_without_tables() {
        assert_eq!(table("SELECT 1"), None);
        assert_eq!(table("SELECT CATALOG()"), None);
        assert_eq!(table("SET NAMES utf8mb4"), None);
        assert_eq!(table(""), None);
    }
}
