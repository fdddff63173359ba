use std::fmt;
use std::sync::OnceLock;

use mongodb::bson::{Bson, Document};
use regex::Regex;

use crate::config::SecurityPolicy;
use crate::db::sql_text::{effective_keyword, is_read_keyword, split_statements};

/// Errors that can occur during input validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    TooLong { max: usize, actual: usize },
    NullBytes,
    SqlInjection(&'static str),
    InvalidIdentifier(String),
    EmptyInput,
    InvalidConnectionString(String),
    PolicyViolation(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::TooLong { max, actual } => {
                write!(f, "Input length {} exceeds maximum of {}", actual, max)
            }
            ValidationError::NullBytes => write!(f, "Input contains null bytes"),
            ValidationError::SqlInjection(pattern) => {
                write!(f, "suspicious pattern detected ({})", pattern)
            }
            ValidationError::InvalidIdentifier(reason) => {
                write!(f, "Invalid SQL identifier: {}", reason)
            }
            ValidationError::EmptyInput => write!(f, "Input must not be empty"),
            ValidationError::InvalidConnectionString(reason) => {
                write!(f, "Invalid connection string: {}", reason)
            }
            ValidationError::PolicyViolation(reason) => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for ValidationError {}

/// SQL keywords that should not appear as standalone identifiers.
const DANGEROUS_SQL_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "INSERT", "UPDATE", "ALTER", "CREATE", "EXEC", "EXECUTE",
    "UNION", "SELECT", "TRUNCATE", "GRANT", "REVOKE",
];

/// Named heuristics for injection and exfiltration shapes. Case-insensitive.
const SUSPICIOUS_PATTERNS: &[(&str, &str)] = &[
    ("union_select", r"(?i)\bunion\b(?:\s+(?:all|distinct))?[\s(]+select\b"),
    ("chained_destructive", r"(?i);\s*(?:drop|delete|update|truncate|alter)\b"),
    (
        "file_read",
        r"(?i)\b(?:load_file|pg_read_file|pg_read_binary_file|openrowset)\s*\(|\bload\s+data\s+(?:local\s+)?infile\b|\bbulk\s+insert\b",
    ),
    ("file_write", r"(?i)\binto\s+(?:out|dump)file\b|\bcopy\b[^;]*\bto\s+'"),
    (
        "timing",
        r"(?i)\bwaitfor\s+delay\b|\b(?:pg_)?sleep\s*\(|\bbenchmark\s*\(",
    ),
    (
        "command_exec",
        r"(?i)\bxp_cmdshell\b|\bsp_oacreate\b|\bfrom\s+program\b",
    ),
    ("tautology", r"(?i)'\s*or\s+'?\d+'?\s*=\s*'?\d+"),
];

fn compiled_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        SUSPICIOUS_PATTERNS
            .iter()
            .filter_map(|(name, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*name, re)),
                Err(e) => {
                    log::error!("Invalid suspicious-pattern regex '{}': {}", name, e);
                    None
                }
            })
            .collect()
    })
}

/// Name of the first heuristic the statement matches, if any.
pub fn find_suspicious_pattern(statement: &str) -> Option<&'static str> {
    compiled_patterns()
        .iter()
        .find(|(_, re)| re.is_match(statement))
        .map(|(name, _)| *name)
}

/// What a successful scan learned about a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryInspection {
    pub length: usize,
    pub statement_count: usize,
}

/// Length ceiling, null bytes and pattern scan. Heuristic, not a parser.
pub fn validate_query(statement: &str, max_length: usize) -> Result<QueryInspection, ValidationError> {
    let length = statement.chars().count();
    if length > max_length {
        return Err(ValidationError::TooLong {
            max: max_length,
            actual: length,
        });
    }

    if statement.contains('\0') {
        return Err(ValidationError::NullBytes);
    }

    if let Some(pattern) = find_suspicious_pattern(statement) {
        return Err(ValidationError::SqlInjection(pattern));
    }

    Ok(QueryInspection {
        length,
        statement_count: split_statements(statement).len(),
    })
}

const DATA_MODIFICATION_KEYWORDS: &[&str] =
    &["INSERT", "UPDATE", "DELETE", "MERGE", "REPLACE", "UPSERT"];

/// Document-store commands that only read.
const DOCUMENT_READ_COMMANDS: &[&str] = &[
    "find",
    "aggregate",
    "count",
    "distinct",
    "listCollections",
    "listIndexes",
    "listDatabases",
    "collStats",
    "dbStats",
    "ping",
    "hello",
    "isMaster",
    "buildInfo",
    "serverStatus",
    "explain",
];

/// What the write policy sees of one statement.
#[derive(Debug, Clone, PartialEq)]
struct StatementClass {
    /// SQL keyword, or the SQL verb a document command amounts to
    keyword: String,
    /// Name used in rejection messages
    label: String,
}

impl StatementClass {
    fn sql(part: &str) -> Self {
        let keyword = effective_keyword(part).unwrap_or_default();
        let label = if keyword.is_empty() {
            "non-SQL".to_string()
        } else {
            keyword.clone()
        };
        Self { keyword, label }
    }

    /// JSON objects are run as database commands by the document adapter.
    /// The command is named by the first key.
    fn document(part: &str) -> Option<Self> {
        let trimmed = part.trim_start();
        if !trimmed.starts_with('{') {
            return None;
        }
        let Ok(command) = serde_json::from_str::<Document>(trimmed) else {
            return Some(Self {
                keyword: String::new(),
                label: "malformed document command".to_string(),
            });
        };
        let name = command.keys().next().cloned().unwrap_or_default();

        let keyword = match name.as_str() {
            n if n.starts_with("drop") => "DROP",
            "insert" => "INSERT",
            "update" | "findAndModify" => "UPDATE",
            "delete" => "DELETE",
            "aggregate" if pipeline_writes(&command) => "MERGE",
            n if DOCUMENT_READ_COMMANDS.contains(&n) => "SELECT",
            _ => "",
        };
        Some(Self {
            keyword: keyword.to_string(),
            label: format!("{} command", name),
        })
    }

    fn of(part: &str) -> Self {
        Self::document(part).unwrap_or_else(|| Self::sql(part))
    }
}

/// Whether an aggregation writes its output through `$out` or `$merge`.
fn pipeline_writes(command: &Document) -> bool {
    let Ok(stages) = command.get_array("pipeline") else {
        return false;
    };
    stages.iter().any(|stage| match stage {
        Bson::Document(stage) => stage.contains_key("$out") || stage.contains_key("$merge"),
        _ => false,
    })
}

/// Check every statement of a batch against the write policy.
pub fn check_policy(statement: &str, policy: &SecurityPolicy) -> Result<(), ValidationError> {
    for part in split_statements(statement) {
        let class = StatementClass::of(&part);
        let keyword = class.keyword.as_str();

        if policy.read_only && !is_read_keyword(keyword) {
            return Err(ValidationError::PolicyViolation(format!(
                "read-only mode rejects {} statements",
                class.label
            )));
        }
        if !policy.allow_data_modification && DATA_MODIFICATION_KEYWORDS.contains(&keyword) {
            return Err(ValidationError::PolicyViolation(format!(
                "data modification ({}) is not permitted",
                class.label
            )));
        }
        if !policy.allow_drop && keyword == "DROP" {
            let reason = if class.label == keyword {
                "DROP statements are not permitted".to_string()
            } else {
                format!("DROP statements are not permitted ({})", class.label)
            };
            return Err(ValidationError::PolicyViolation(reason));
        }
        if !policy.allow_truncate && keyword == "TRUNCATE" {
            return Err(ValidationError::PolicyViolation(
                "TRUNCATE statements are not permitted".to_string(),
            ));
        }
    }
    Ok(())
}

/// Validate that a string is a safe table identifier.
///
/// Valid identifiers:
/// - Have at most one `.` separating a schema qualifier from the table
/// - Each part starts with a letter or underscore
/// - Contain only letters, digits, underscores and `$`
/// - Are not SQL keywords
/// - Are between 1 and 128 characters
pub fn validate_table_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyInput);
    }

    if name.len() > 128 {
        return Err(ValidationError::TooLong {
            max: 128,
            actual: name.len(),
        });
    }

    if name.contains('\0') {
        return Err(ValidationError::NullBytes);
    }

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(ValidationError::InvalidIdentifier(
            "at most one schema qualifier is allowed".to_string(),
        ));
    }

    for part in parts {
        let Some(first) = part.chars().next() else {
            return Err(ValidationError::InvalidIdentifier(
                "empty name segment".to_string(),
            ));
        };
        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(ValidationError::InvalidIdentifier(
                "must start with a letter or underscore".to_string(),
            ));
        }

        if !part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        {
            return Err(ValidationError::InvalidIdentifier(
                "must contain only letters, digits, underscores, and $".to_string(),
            ));
        }

        let upper = part.to_uppercase();
        if DANGEROUS_SQL_KEYWORDS.contains(&upper.as_str()) {
            return Err(ValidationError::InvalidIdentifier(format!(
                "'{}' is a reserved SQL keyword",
                part
            )));
        }
    }

    Ok(())
}

/// Validate a connection string for suspicious patterns.
pub fn validate_connection_string(conn_str: &str) -> Result<(), ValidationError> {
    if conn_str.is_empty() {
        return Err(ValidationError::EmptyInput);
    }

    if conn_str.contains('\0') {
        return Err(ValidationError::NullBytes);
    }

    if conn_str.contains("../") || conn_str.contains("..\\") {
        return Err(ValidationError::InvalidConnectionString(
            "path traversal detected".to_string(),
        ));
    }

    let upper = conn_str.to_uppercase();

    // Connection strings should not contain SQL statements
    let dangerous_patterns = [
        "DROP TABLE",
        "DROP DATABASE",
        "DELETE FROM",
        ";--",
        "EXEC(",
        "EXECUTE(",
        "XP_CMDSHELL",
        "SP_EXECUTESQL",
    ];

    for pattern in &dangerous_patterns {
        if upper.contains(pattern) {
            return Err(ValidationError::InvalidConnectionString(format!(
                "suspicious pattern: {}",
                pattern.to_lowercase()
            )));
        }
    }

    // Check for shell injection via backticks or $()
    if conn_str.contains('`') || conn_str.contains("$(") {
        return Err(ValidationError::InvalidConnectionString(
            "shell injection pattern detected".to_string(),
        ));
    }

    Ok(())
}

/// Strip control characters from a string for safe display.
/// Preserves newlines, carriage returns, and tabs.
pub fn sanitize_for_display(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\r' || *c == '\t')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern_of(sql: &str) -> Option<&'static str> {
        match validate_query(sql, 10_000) {
            Err(ValidationError::SqlInjection(name)) => Some(name),
            _ => None,
        }
    }

    // --- validate_query tests ---

    #[test]
    fn test_plain_queries_accepted() {
        assert!(validate_query("SELECT * FROM users WHERE id = ?", 10_000).is_ok());
        assert!(validate_query("UPDATE users SET name = ? WHERE id = ?", 10_000).is_ok());
        assert!(validate_query("SELECT 'union' AS word, sleepy FROM t", 10_000).is_ok());
    }

    #[test]
    fn test_union_select_rejected() {
        assert_eq!(
            pattern_of("SELECT * FROM users UNION SELECT password FROM admins"),
            Some("union_select")
        );
        assert_eq!(pattern_of("select 1 union all select 2"), Some("union_select"));
    }

    #[test]
    fn test_chained_destructive_rejected() {
        assert_eq!(pattern_of("x; DROP TABLE users"), Some("chained_destructive"));
        assert_eq!(
            pattern_of("SELECT 1;delete from audit"),
            Some("chained_destructive")
        );
    }

    #[test]
    fn test_file_primitives_rejected() {
        assert_eq!(pattern_of("SELECT LOAD_FILE('/etc/passwd')"), Some("file_read"));
        assert_eq!(pattern_of("SELECT pg_read_file('postgresql.conf')"), Some("file_read"));
        assert_eq!(
            pattern_of("SELECT * FROM users INTO OUTFILE '/tmp/u.txt'"),
            Some("file_write")
        );
        assert_eq!(pattern_of("COPY users TO '/tmp/users.csv'"), Some("file_write"));
    }

    #[test]
    fn test_timing_primitives_rejected() {
        assert_eq!(pattern_of("SELECT pg_sleep(10)"), Some("timing"));
        assert_eq!(pattern_of("WAITFOR DELAY '00:00:10'"), Some("timing"));
        assert_eq!(pattern_of("SELECT BENCHMARK(1000000, MD5('x'))"), Some("timing"));
    }

    #[test]
    fn test_command_exec_and_tautology_rejected() {
        assert_eq!(pattern_of("EXEC xp_cmdshell 'dir'"), Some("command_exec"));
        assert_eq!(
            pattern_of("SELECT * FROM users WHERE name = '' OR '1'='1'"),
            Some("tautology")
        );
    }

    #[test]
    fn test_length_ceiling() {
        let exact = "a".repeat(10_000);
        assert!(validate_query(&exact, 10_000).is_ok());
        let over = "a".repeat(10_001);
        assert_eq!(
            validate_query(&over, 10_000),
            Err(ValidationError::TooLong {
                max: 10_000,
                actual: 10_001
            })
        );
    }

    #[test]
    fn test_statement_count() {
        let inspection = validate_query("SELECT 1; SELECT 2;", 100).unwrap();
        assert_eq!(inspection.statement_count, 2);
        assert_eq!(validate_query("SELECT ';'", 100).unwrap().statement_count, 1);
    }

    #[test]
    fn test_null_bytes_rejected() {
        assert_eq!(
            validate_query("SELECT 1\0", 100),
            Err(ValidationError::NullBytes)
        );
    }

    // --- check_policy tests ---

    #[test]
    fn test_default_policy() {
        let policy = SecurityPolicy::default();
        assert!(check_policy("INSERT INTO t VALUES (1)", &policy).is_ok());
        assert!(check_policy("DROP TABLE t", &policy).is_err());
        assert!(check_policy("truncate table t", &policy).is_err());
    }

    #[test]
    fn test_read_only_policy() {
        let policy = SecurityPolicy {
            read_only: true,
            ..Default::default()
        };
        assert!(check_policy("SELECT * FROM t", &policy).is_ok());
        assert!(check_policy("WITH x AS (SELECT 1) SELECT * FROM x", &policy).is_ok());
        let err = check_policy("SELECT 1; UPDATE t SET a = 1", &policy).unwrap_err();
        assert!(err.to_string().contains("UPDATE"));
    }

    #[test]
    fn test_no_data_modification_policy() {
        let policy = SecurityPolicy {
            allow_data_modification: false,
            ..Default::default()
        };
        assert!(check_policy("SELECT 1", &policy).is_ok());
        assert!(check_policy("DELETE FROM t", &policy).is_err());
        assert!(check_policy("merge into t using s on 1 = 1", &policy).is_err());
    }

    #[test]
    fn test_writing_cte_counts_as_modification() {
        let sql = "WITH d AS (DELETE FROM users RETURNING *) SELECT * FROM d";
        let read_only = SecurityPolicy {
            read_only: true,
            ..Default::default()
        };
        let err = check_policy(sql, &read_only).unwrap_err();
        assert!(err.to_string().contains("DELETE"));

        let no_writes = SecurityPolicy {
            allow_data_modification: false,
            ..Default::default()
        };
        assert!(check_policy(sql, &no_writes).is_err());
    }

    #[test]
    fn test_document_drop_commands_rejected_by_default() {
        let policy = SecurityPolicy::default();
        for command in [
            r#"{"drop": "users"}"#,
            r#"{"dropDatabase": 1}"#,
            r#" {"dropIndexes": "users", "index": "*"}"#,
        ] {
            let err = check_policy(command, &policy).unwrap_err();
            assert!(err.to_string().contains("DROP"), "{command}");
        }
        assert!(check_policy(r#"{"find": "users", "filter": {"drop": 1}}"#, &policy).is_ok());
    }

    #[test]
    fn test_document_write_commands_follow_modification_policy() {
        let policy = SecurityPolicy {
            allow_data_modification: false,
            ..Default::default()
        };
        for command in [
            r#"{"delete": "users", "deletes": [{"q": {}, "limit": 0}]}"#,
            r#"{"insert": "users", "documents": [{"name": "a"}]}"#,
            r#"{"update": "users", "updates": [{"q": {}, "u": {"$set": {"a": 1}}}]}"#,
            r#"{"findAndModify": "users", "query": {}, "remove": true}"#,
            r#"{"aggregate": "users", "pipeline": [{"$match": {}}, {"$out": "copy"}], "cursor": {}}"#,
        ] {
            let err = check_policy(command, &policy).unwrap_err();
            assert!(err.to_string().starts_with("data modification"), "{command}");
        }
        assert!(check_policy(
            r#"{"aggregate": "users", "pipeline": [{"$match": {}}], "cursor": {}}"#,
            &policy
        )
        .is_ok());
        assert!(check_policy(r#"{"delete": "users", "deletes": []}"#, &SecurityPolicy::default()).is_ok());
    }

    #[test]
    fn test_read_only_allows_only_document_reads() {
        let policy = SecurityPolicy {
            read_only: true,
            ..Default::default()
        };
        assert!(check_policy(r#"{"find": "users", "filter": {"age": {"$gt": 3}}}"#, &policy).is_ok());
        assert!(check_policy(r#"{"count": "users"}"#, &policy).is_ok());
        assert!(check_policy(r#"{"listCollections": 1}"#, &policy).is_ok());

        let err = check_policy(r#"{"createIndexes": "users", "indexes": []}"#, &policy).unwrap_err();
        assert_eq!(
            err.to_string(),
            "read-only mode rejects createIndexes command statements"
        );
        assert!(check_policy(r#"{"find": "users""#, &policy).is_err());
    }

    #[test]
    fn test_drop_allowed_when_enabled() {
        let policy = SecurityPolicy {
            allow_drop: true,
            ..Default::default()
        };
        assert!(check_policy("DROP TABLE t", &policy).is_ok());
    }

    // --- validate_table_name tests ---

    #[test]
    fn test_valid_table_names() {
        assert!(validate_table_name("users").is_ok());
        assert!(validate_table_name("my_table").is_ok());
        assert!(validate_table_name("_private").is_ok());
        assert!(validate_table_name("Table1").is_ok());
        assert!(validate_table_name("dbo.users").is_ok());
        assert!(validate_table_name("sys$log").is_ok());
    }

    #[test]
    fn test_table_name_empty() {
        assert_eq!(validate_table_name(""), Err(ValidationError::EmptyInput));
    }

    #[test]
    fn test_table_name_starts_with_number() {
        assert!(matches!(
            validate_table_name("1table"),
            Err(ValidationError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_table_name_with_special_characters() {
        assert!(validate_table_name("my table").is_err());
        assert!(validate_table_name("my-table").is_err());
        assert!(validate_table_name("a.b.c").is_err());
        assert!(validate_table_name("schema.").is_err());
        assert!(validate_table_name("my;table").is_err());
        assert!(validate_table_name("my'table").is_err());
    }

    #[test]
    fn test_table_name_sql_keywords() {
        assert!(matches!(
            validate_table_name("DROP"),
            Err(ValidationError::InvalidIdentifier(_))
        ));
        assert!(validate_table_name("public.select").is_err());
    }

    #[test]
    fn test_table_name_too_long() {
        let name = "a".repeat(129);
        assert!(matches!(
            validate_table_name(&name),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_table_name_with_sql_injection() {
        assert!(validate_table_name("users;DROP TABLE admin").is_err());
    }

    // --- validate_connection_string tests ---

    #[test]
    fn test_valid_connection_strings() {
        assert!(validate_connection_string("https://abc.supabase.co").is_ok());
        assert!(validate_connection_string("mongodb://localhost:27017/mydb").is_ok());
        assert!(validate_connection_string("mongodb+srv://user:pw@cluster0.example.net").is_ok());
    }

    #[test]
    fn test_connection_string_rejections() {
        assert_eq!(validate_connection_string(""), Err(ValidationError::EmptyInput));
        assert!(validate_connection_string("mongodb://../../etc/passwd").is_err());
        assert!(validate_connection_string("mongodb://h/db;DROP TABLE users").is_err());
        assert!(validate_connection_string("https://`whoami`.example").is_err());
        assert!(validate_connection_string("https://$(id).example").is_err());
    }

    // --- sanitize_for_display tests ---

    #[test]
    fn test_sanitize_preserves_whitespace() {
        assert_eq!(
            sanitize_for_display("hello\tworld\nfoo\r\nbar"),
            "hello\tworld\nfoo\r\nbar"
        );
    }

    #[test]
    fn test_sanitize_strips_control_chars() {
        assert_eq!(sanitize_for_display("hello\x07world"), "helloworld");
        assert_eq!(sanitize_for_display("\x01\x02\x03test"), "test");
    }
}
