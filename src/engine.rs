use crate::conn::{ConnectTarget, Connector, Session};
use crate::error::{
    EngineError, ER_ACCESS_DENIED_ERROR, ER_BAD_DB_ERROR, ER_DB_CREATE_EXISTS, ER_DB_DROP_EXISTS,
    ER_UNKNOWN_ERROR, ER_UNKNOWN_SYSTEM_VARIABLE,
};
use crate::model::{Cell, ResultSet};
use crate::tenant::ROOT_CATALOG;
use parking_lot::{Mutex, MutexGuard};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, OnceLock};

/// Most recent statements and closed sessions kept for inspection.
const HISTORY_LIMIT: usize = 1024;

const DEFAULT_SQL_MODE: &str =
    "STRICT_TRANS_TABLES,ERROR_FOR_DIVISION_BY_ZERO,NO_AUTO_CREATE_USER,NO_ENGINE_SUBSTITUTION";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub session: u64,
    pub catalog: String,
    pub database: Option<String>,
    pub statement: String,
}

struct EngineState {
    version: String,
    catalogs: BTreeMap<String, BTreeSet<String>>,
    seed_databases: BTreeSet<String>,
    users: BTreeMap<String, String>,
    default_sql_mode: String,
    reachable: bool,
    pending_failures: u32,
    next_session: u64,
    journal: VecDeque<JournalEntry>,
    closed: VecDeque<u64>,
}

impl EngineState {
    fn add_catalog(&mut self, name: &str) -> bool {
        if self.catalogs.contains_key(name) {
            return false;
        }
        self.catalogs
            .insert(name.to_string(), self.seed_databases.clone());
        true
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, item: T) {
    if history.len() == HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(item);
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Mutex<EngineState>>,
}

impl Engine {
    pub fn new(version: &str) -> Self {
        let mut catalogs = BTreeMap::new();
        catalogs.insert(ROOT_CATALOG.to_string(), BTreeSet::new());
        Self {
            inner: Arc::new(Mutex::new(EngineState {
                version: version.to_string(),
                catalogs,
                seed_databases: BTreeSet::new(),
                users: BTreeMap::new(),
                default_sql_mode: DEFAULT_SQL_MODE.to_string(),
                reachable: true,
                pending_failures: 0,
                next_session: 1,
                journal: VecDeque::new(),
                closed: VecDeque::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.lock()
    }

    pub fn with_user(self, user: &str, password: &str) -> Self {
        self.state()
            .users
            .insert(user.to_string(), password.to_string());
        self
    }

    pub fn with_database(self, name: &str) -> Self {
        {
            let mut st = self.state();
            st.seed_databases.insert(name.to_string());
            for dbs in st.catalogs.values_mut() {
                dbs.insert(name.to_string());
            }
        }
        self
    }

    pub fn with_catalog(self, name: &str) -> Self {
        self.add_catalog(name);
        self
    }

    pub fn add_catalog(&self, name: &str) -> bool {
        self.state().add_catalog(name)
    }

    pub fn remove_catalog(&self, name: &str) -> bool {
        self.state().catalogs.remove(name).is_some()
    }

    pub fn catalogs(&self) -> Vec<String> {
        self.state().catalogs.keys().cloned().collect()
    }

    pub fn has_database(&self, catalog: &str, database: &str) -> bool {
        self.state()
            .catalogs
            .get(catalog)
            .is_some_and(|dbs| dbs.contains(database))
    }

    pub fn version(&self) -> String {
        self.state().version.clone()
    }

    pub fn set_default_sql_mode(&self, mode: &str) {
        self.state().default_sql_mode = mode.to_string();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// The next `n` statements fail with a transport error.
    pub fn fail_next_statements(&self, n: u32) {
        self.state().pending_failures = n;
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state().journal.iter().cloned().collect()
    }

    pub fn clear_journal(&self) {
        self.state().journal.clear();
    }

    pub fn closed_sessions(&self) -> Vec<u64> {
        self.state().closed.iter().copied().collect()
    }

    pub fn open_session(
        &self,
        user: &str,
        password: &str,
        database: Option<&str>,
    ) -> Result<EngineSession, EngineError> {
        {
            let st = self.state();
            if !st.reachable {
                return Err(EngineError::Io("connection refused".into()));
            }
            if !st.users.is_empty() && st.users.get(user).map(String::as_str) != Some(password) {
                return Err(EngineError::server(
                    ER_ACCESS_DENIED_ERROR,
                    format!("Access denied for user '{user}'"),
                ));
            }
        }
        let mut session = self.attach();
        if let Some(db) = database {
            session.init_db(db)?;
        }
        Ok(session)
    }

    pub fn attach(&self) -> EngineSession {
        let mut st = self.state();
        let id = st.next_session;
        st.next_session += 1;
        EngineSession {
            engine: self.clone(),
            id,
            catalog: ROOT_CATALOG.to_string(),
            database: None,
            charset: "latin1".into(),
            sql_mode: st.default_sql_mode.clone(),
        }
    }
}

pub struct EngineSession {
    engine: Engine,
    id: u64,
    catalog: String,
    database: Option<String>,
    charset: String,
    sql_mode: String,
}

impl EngineSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn catalog(&self) -> &str {
        &self.catalog
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn engine_version(&self) -> String {
        self.engine.version()
    }

    pub fn init_db(&mut self, name: &str) -> Result<(), EngineError> {
        let (catalog, db) = match name.split_once('.') {
            Some((catalog, db)) => (unquote_identifier(catalog), unquote_identifier(db)),
            None => (self.catalog.clone(), unquote_identifier(name)),
        };
        let st = self.engine.state();
        let Some(dbs) = st.catalogs.get(&catalog) else {
            return Err(unknown_catalog(&catalog));
        };
        if !dbs.contains(&db) {
            return Err(EngineError::server(
                ER_BAD_DB_ERROR,
                format!("Unknown database '{db}'"),
            ));
        }
        drop(st);
        self.catalog = catalog;
        self.database = Some(db);
        Ok(())
    }

    fn use_catalog(&mut self, name: &str) -> Result<ResultSet, EngineError> {
        let name = unquote_identifier(name);
        if !self.engine.state().catalogs.contains_key(&name) {
            return Err(unknown_catalog(&name));
        }
        self.catalog = name;
        self.database = None;
        Ok(ResultSet::ok(0))
    }

    fn use_database(&mut self, name: &str) -> Result<ResultSet, EngineError> {
        let name = unquote_identifier(name);
        let exists = self
            .engine
            .state()
            .catalogs
            .get(&self.catalog)
            .is_some_and(|dbs| dbs.contains(&name));
        if !exists {
            return Err(EngineError::server(
                ER_BAD_DB_ERROR,
                format!("Unknown database '{name}'"),
            ));
        }
        self.database = Some(name);
        Ok(ResultSet::ok(0))
    }

    fn create_catalog(&mut self, name: &str) -> Result<ResultSet, EngineError> {
        let name = unquote_identifier(name);
        if !self.engine.state().add_catalog(&name) {
            return Err(EngineError::server(
                ER_DB_CREATE_EXISTS,
                format!("Can't create catalog '{name}'; catalog exists"),
            ));
        }
        Ok(ResultSet::ok(1))
    }

    fn drop_catalog(&mut self, name: &str) -> Result<ResultSet, EngineError> {
        let name = unquote_identifier(name);
        if name == ROOT_CATALOG {
            return Err(EngineError::server(
                ER_UNKNOWN_ERROR,
                "The default catalog cannot be dropped",
            ));
        }
        if self.engine.state().catalogs.remove(&name).is_none() {
            return Err(EngineError::server(
                ER_DB_DROP_EXISTS,
                format!("Can't drop catalog '{name}'; catalog doesn't exist"),
            ));
        }
        Ok(ResultSet::ok(0))
    }

    fn create_database(&mut self, name: &str, if_not_exists: bool) -> Result<ResultSet, EngineError> {
        let name = unquote_identifier(name);
        let mut st = self.engine.state();
        let Some(dbs) = st.catalogs.get_mut(&self.catalog) else {
            return Err(unknown_catalog(&self.catalog));
        };
        if !dbs.insert(name.clone()) && !if_not_exists {
            return Err(EngineError::server(
                ER_DB_CREATE_EXISTS,
                format!("Can't create database '{name}'; database exists"),
            ));
        }
        Ok(ResultSet::ok(1))
    }

    fn select_variables(&self, list: &str) -> Result<ResultSet, EngineError> {
        let mut out = ResultSet::default();
        let mut row = Vec::new();
        for raw in list.split(',').map(str::trim) {
            let name = raw.trim_start_matches("@@");
            let name = match name.split_once('.') {
                Some((scope, var))
                    if scope.eq_ignore_ascii_case("session")
                        || scope.eq_ignore_ascii_case("global") =>
                {
                    var
                }
                _ => name,
            };
            let value = match name.to_ascii_lowercase().as_str() {
                "sql_mode" => Cell::Text(self.sql_mode.clone()),
                "character_set_client" | "character_set_connection" | "character_set_results" => {
                    Cell::Text(self.charset.clone())
                }
                "max_allowed_packet" => Cell::Int(16 * 1024 * 1024),
                "wait_timeout" => Cell::Int(28_800),
                "autocommit" => Cell::Int(1),
                "socket" => Cell::Text(String::new()),
                "version" => Cell::Text(self.engine.version()),
                "version_comment" => Cell::Text("catalog-sandbox".into()),
                _ => {
                    return Err(EngineError::server(
                        ER_UNKNOWN_SYSTEM_VARIABLE,
                        format!("Unknown system variable '{name}'"),
                    ))
                }
            };
            out.columns.push(raw.to_string());
            row.push(value);
        }
        out.rows.push(row);
        Ok(out)
    }

    fn set_statement(&mut self, q: &str) -> Result<ResultSet, EngineError> {
        static SQL_MODE: OnceLock<Regex> = OnceLock::new();
        let re = SQL_MODE.get_or_init(|| {
            Regex::new(r"(?is)^SET\s+(?:SESSION\s+|@@SESSION\.|@@)?sql_mode\s*=\s*'([^']*)'\s*$")
                .expect("valid sql_mode regex")
        });
        if let Some(caps) = re.captures(q) {
            self.sql_mode = caps
                .get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
        }
        Ok(ResultSet::ok(0))
    }
}

impl Session for EngineSession {
    fn execute(&mut self, sql: &str) -> Result<ResultSet, EngineError> {
        {
            let mut st = self.engine.state();
            if st.pending_failures > 0 {
                st.pending_failures -= 1;
                return Err(EngineError::Io("connection reset by peer".into()));
            }
            let entry = JournalEntry {
                session: self.id,
                catalog: self.catalog.clone(),
                database: self.database.clone(),
                statement: sql.trim().to_string(),
            };
            push_bounded(&mut st.journal, entry);
        }

        let q = strip_trailing_semicolon(strip_leading_comments(sql));
        let words: Vec<&str> = q.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
        let keys: Vec<&str> = upper.iter().map(String::as_str).collect();

        match keys.as_slice() {
            ["SHOW", "CATALOGS"] => Ok(ResultSet::single_column(
                "Catalog",
                self.engine
                    .state()
                    .catalogs
                    .keys()
                    .map(|c| Cell::Text(c.clone())),
            )),
            ["USE", "CATALOG", _] => self.use_catalog(words[2]),
            ["USE", _] => self.use_database(words[1]),
            ["CREATE", "CATALOG", _] => self.create_catalog(words[2]),
            ["DROP", "CATALOG", _] => self.drop_catalog(words[2].trim_matches('\'')),
            ["CREATE", "DATABASE", "IF", "NOT", "EXISTS", _] => self.create_database(words[5], true),
            ["CREATE", "DATABASE", _] => self.create_database(words[2], false),
            ["SELECT", "VERSION()"] => Ok(ResultSet::single_column(
                "VERSION()",
                [Cell::Text(self.engine.version())],
            )),
            ["SELECT", "CATALOG()"] => Ok(ResultSet::single_column(
                "CATALOG()",
                [Cell::Text(self.catalog.clone())],
            )),
            ["SELECT", "DATABASE()"] => Ok(ResultSet::single_column(
                "DATABASE()",
                [self.database.clone().map(Cell::Text).unwrap_or(Cell::Null)],
            )),
            ["SET", "NAMES", ..] => {
                self.charset = unquote_identifier(words.get(2).copied().unwrap_or("utf8mb4"))
                    .trim_matches('\'')
                    .to_string();
                Ok(ResultSet::ok(0))
            }
            ["SET", ..] => self.set_statement(q),
            ["SELECT", first, ..] if first.starts_with("@@") => {
                let list = q[6..].trim();
                self.select_variables(list)
            }
            _ => Ok(ResultSet::ok(0)),
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        push_bounded(&mut self.engine.state().closed, self.id);
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    engine: Engine,
}

impl MemoryConnector {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Connector for MemoryConnector {
    type Session = EngineSession;

    fn open(&self, target: &ConnectTarget) -> Result<EngineSession, EngineError> {
        self.engine
            .open_session(&target.user, &target.password, target.database.as_deref())
    }
}

fn unknown_catalog(name: &str) -> EngineError {
    EngineError::server(ER_BAD_DB_ERROR, format!("Unknown catalog '{name}'"))
}

fn strip_trailing_semicolon(s: &str) -> &str {
    let s = s.trim();
    s.strip_suffix(';').map(str::trim).unwrap_or(s)
}

fn strip_leading_comments(mut s: &str) -> &str {
    loop {
        let t = s.trim_start();
        if let Some(rest) = t.strip_prefix("/*") {
            if let Some(end) = rest.find("*/") {
                s = &rest[end + 2..];
                continue;
            }
        }
        return t;
    }
}

fn unquote_identifier(token: &str) -> String {
    let t = token.trim();
    if let Some(stripped) = t.strip_prefix('`').and_then(|s| s.strip_suffix('`')) {
        stripped.replace("``", "`")
    } else {
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(engine: &Engine) -> EngineSession {
        engine.open_session("root", "", None).unwrap()
    }

    #[test]
    fn catalog_lifecycle() {
        let engine = Engine::new("11.7.2-MariaDB").with_database("wordpress");
        let mut s = session(&engine);

        s.execute("CREATE CATALOG blog_2").unwrap();
        assert!(s.execute("CREATE CATALOG blog_2").is_err());
        assert!(engine.has_database("blog_2", "wordpress"));

        s.execute("USE CATALOG blog_2").unwrap();
        s.execute("USE `wordpress`").unwrap();
        let cat = s.execute("SELECT CATALOG()").unwrap();
        assert_eq!(cat.first_text(), Some("blog_2"));

        s.execute("USE CATALOG def").unwrap();
        s.execute("DROP CATALOG blog_2").unwrap();
        assert_eq!(engine.catalogs(), vec!["def".to_string()]);
        assert_eq!(
            s.execute("USE CATALOG blog_2").unwrap_err().code(),
            Some(ER_BAD_DB_ERROR)
        );
    }

    #[test]
    fn qualified_connect_database() {
        let engine = Engine::new("11.7.2-MariaDB")
            .with_database("wordpress")
            .with_catalog("blog_3");
        let s = engine
            .open_session("wp", "x", Some("blog_3.wordpress"))
            .unwrap();
        assert_eq!(s.catalog(), "blog_3");
        assert_eq!(s.database(), Some("wordpress"));
        assert!(engine.open_session("wp", "x", Some("blog_4.wordpress")).is_err());
    }

    #[test]
    fn session_variables() {
        let engine = Engine::new("11.7.2-MariaDB");
        let mut s = session(&engine);
        s.execute("SET NAMES utf8mb4").unwrap();
        s.execute("SET SESSION sql_mode='NO_ENGINE_SUBSTITUTION'").unwrap();
        let vars = s
            .execute("SELECT @@SESSION.sql_mode, @@character_set_client, @@max_allowed_packet")
            .unwrap();
        assert_eq!(
            vars.rows[0],
            vec![
                Cell::Text("NO_ENGINE_SUBSTITUTION".into()),
                Cell::Text("utf8mb4".into()),
                Cell::Int(16 * 1024 * 1024),
            ]
        );
        assert_eq!(
            s.execute("SELECT @@nonsense").unwrap_err().code(),
            Some(ER_UNKNOWN_SYSTEM_VARIABLE)
        );
    }

    #[test]
    fn journal_and_close_tracking() {
        let engine = Engine::new("11.7.2-MariaDB");
        let mut s = session(&engine);
        let id = s.id();
        s.execute("SELECT * FROM wp_posts").unwrap();
        engine.fail_next_statements(1);
        assert!(s.execute("SELECT 1").unwrap_err().is_transient());
        drop(s);

        let journal = engine.journal();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].statement, "SELECT * FROM wp_posts");
        assert_eq!(journal[0].catalog, "def");
        assert_eq!(engine.closed_sessions(), vec![id]);
    }

    #[test]
    fn history_keeps_only_recent_entries() {
        let engine = Engine::new("11.7.2-MariaDB");
        for _ in 0..HISTORY_LIMIT + 5 {
            drop(session(&engine));
        }
        let mut s = session(&engine);
        for i in 0..HISTORY_LIMIT + 10 {
            s.execute(&format!("SELECT {i}")).unwrap();
        }

        let journal = engine.journal();
        assert_eq!(journal.len(), HISTORY_LIMIT);
        assert_eq!(journal[0].statement, "SELECT 10");
        assert_eq!(
            journal.last().map(|e| e.statement.clone()),
            Some(format!("SELECT {}", HISTORY_LIMIT + 9))
        );
        let closed = engine.closed_sessions();
        assert_eq!(closed.len(), HISTORY_LIMIT);
        assert_eq!(closed[0], 6);
    }

    #[test]
    fn credentials_are_checked() {
        let engine = Engine::new("11.7.2-MariaDB").with_user("wp", "secret");
        assert!(engine.open_session("wp", "secret", None).is_ok());
        assert_eq!(
            engine.open_session("wp", "nope", None).err().and_then(|e| e.code()),
            Some(ER_ACCESS_DENIED_ERROR)
        );
    }
}
