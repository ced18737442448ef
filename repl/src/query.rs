//! Data commands
//!
//! One line, one command: a case-insensitive verb followed by arguments.
//! Arguments may be double-quoted to include spaces.

use ember_core::{
    Db, EmberError, EmberResult, Less, SetOptions, SyncPolicy, desc, index_binary, index_float,
    index_int, index_json, index_string, index_uint,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Duration;

/// A parsed data command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Get(String),
    Del(String),
    Ttl(String),
    Keys {
        pattern: String,
        descending: bool,
    },
    Len,
    FlushDb,
    CreateIndex {
        name: String,
        pattern: String,
        kind: IndexKind,
        descending: bool,
    },
    DropIndex(String),
    Indexes,
    /// Walk an index, or the key order when `index` is empty.
    Scan {
        index: String,
        descending: bool,
    },
    Shrink,
    Save(String),
    Load(String),
    Config,
    ConfigSync(SyncPolicy),
}

/// Value ordering for `CREATEINDEX`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKind {
    Binary,
    String,
    Int,
    Uint,
    Float,
    Json(String),
}

impl IndexKind {
    fn parse(word: &str) -> Option<Self> {
        if let Some(path) = word.strip_prefix("json:") {
            return Some(IndexKind::Json(path.to_string()));
        }
        match word.to_ascii_lowercase().as_str() {
            "binary" => Some(IndexKind::Binary),
            "string" => Some(IndexKind::String),
            "int" => Some(IndexKind::Int),
            "uint" => Some(IndexKind::Uint),
            "float" => Some(IndexKind::Float),
            _ => None,
        }
    }

    fn less(&self) -> Less {
        match self {
            IndexKind::Binary => index_binary(),
            IndexKind::String => index_string(),
            IndexKind::Int => index_int(),
            IndexKind::Uint => index_uint(),
            IndexKind::Float => index_float(),
            IndexKind::Json(path) => index_json(path),
        }
    }
}

/// What a command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Value(String),
    /// Result of `SET`: the value it replaced, if any.
    Replaced(Option<String>),
    Count(usize),
    Ttl(Option<Duration>),
    List(Vec<String>),
    Pairs(Vec<(String, String)>),
    Text(String),
}

/// Split a line into words, honouring double quotes and `\"` escapes.
pub fn split_args(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_word = true;
            }
            '\\' if in_quotes => match chars.next() {
                Some(next) => current.push(next),
                None => return Err("dangling escape".to_string()),
            },
            c if c.is_whitespace() && !in_quotes => {
                if has_word {
                    args.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }

    if in_quotes {
        return Err("unterminated quote".to_string());
    }
    if has_word {
        args.push(current);
    }
    Ok(args)
}

fn is_desc(word: Option<&String>) -> Result<bool, String> {
    match word.map(|w| w.to_ascii_lowercase()) {
        None => Ok(false),
        Some(w) if w == "desc" => Ok(true),
        Some(w) if w == "asc" => Ok(false),
        Some(w) => Err(format!("expected ASC or DESC, got '{w}'")),
    }
}

impl Query {
    pub fn parse(line: &str) -> Result<Self, String> {
        let args = split_args(line)?;
        let Some((verb, rest)) = args.split_first() else {
            return Err("empty command".to_string());
        };
        let verb = verb.to_ascii_uppercase();
        let arity = |min: usize, max: usize| {
            if rest.len() < min || rest.len() > max {
                Err(format!("wrong number of arguments for {verb}"))
            } else {
                Ok(())
            }
        };

        let query = match verb.as_str() {
            "SET" => {
                arity(2, 4)?;
                let ttl = match &rest[2..] {
                    [] => None,
                    [ex, secs] if ex.eq_ignore_ascii_case("ex") => {
                        let secs: u64 = secs
                            .parse()
                            .map_err(|_| format!("invalid expiration '{secs}'"))?;
                        Some(Duration::from_secs(secs))
                    }
                    _ => return Err("usage: SET key value [EX seconds]".to_string()),
                };
                Query::Set {
                    key: rest[0].clone(),
                    value: rest[1].clone(),
                    ttl,
                }
            }
            "GET" => {
                arity(1, 1)?;
                Query::Get(rest[0].clone())
            }
            "DEL" => {
                arity(1, 1)?;
                Query::Del(rest[0].clone())
            }
            "TTL" => {
                arity(1, 1)?;
                Query::Ttl(rest[0].clone())
            }
            "KEYS" => {
                arity(1, 2)?;
                Query::Keys {
                    pattern: rest[0].clone(),
                    descending: is_desc(rest.get(1))?,
                }
            }
            "LEN" => {
                arity(0, 0)?;
                Query::Len
            }
            "FLUSHDB" => {
                arity(0, 0)?;
                Query::FlushDb
            }
            "CREATEINDEX" => {
                arity(2, 4)?;
                let kind = match rest.get(2) {
                    Some(word) => IndexKind::parse(word)
                        .ok_or_else(|| format!("unknown index type '{word}'"))?,
                    None => IndexKind::Binary,
                };
                Query::CreateIndex {
                    name: rest[0].clone(),
                    pattern: rest[1].clone(),
                    kind,
                    descending: is_desc(rest.get(3))?,
                }
            }
            "DROPINDEX" => {
                arity(1, 1)?;
                Query::DropIndex(rest[0].clone())
            }
            "INDEXES" => {
                arity(0, 0)?;
                Query::Indexes
            }
            "SCAN" => {
                arity(0, 2)?;
                match rest {
                    [] => Query::Scan {
                        index: String::new(),
                        descending: false,
                    },
                    [word] if is_desc(Some(word)).is_ok() => Query::Scan {
                        index: String::new(),
                        descending: is_desc(Some(word))?,
                    },
                    [index, rest @ ..] => Query::Scan {
                        index: index.clone(),
                        descending: is_desc(rest.first())?,
                    },
                }
            }
            "SHRINK" => {
                arity(0, 0)?;
                Query::Shrink
            }
            "SAVE" => {
                arity(1, 1)?;
                Query::Save(rest[0].clone())
            }
            "LOAD" => {
                arity(1, 1)?;
                Query::Load(rest[0].clone())
            }
            "CONFIG" => match rest {
                [] => Query::Config,
                [field, policy] if field.eq_ignore_ascii_case("sync") => {
                    let policy = policy
                        .parse()
                        .map_err(|_| format!("invalid sync policy '{policy}'"))?;
                    Query::ConfigSync(policy)
                }
                _ => return Err("usage: CONFIG [SYNC never|everysecond|always]".to_string()),
            },
            _ => return Err(format!("unknown command '{verb}'")),
        };
        Ok(query)
    }

    pub fn execute(&self, db: &Db) -> EmberResult<Reply> {
        match self {
            Query::Set { key, value, ttl } => {
                let opts = ttl.map(SetOptions::with_ttl);
                db.update(|tx| tx.set(key, value, opts))
                    .map(|(previous, _)| Reply::Replaced(previous))
            }
            Query::Get(key) => db.view(|tx| tx.get(key)).map(Reply::Value),
            Query::Del(key) => db.update(|tx| tx.delete(key)).map(Reply::Value),
            Query::Ttl(key) => db.view(|tx| tx.ttl(key)).map(Reply::Ttl),
            Query::Keys {
                pattern,
                descending,
            } => db.view(|tx| {
                let mut keys = Vec::new();
                let visit = |key: &str, _: &str| {
                    keys.push(key.to_string());
                    true
                };
                if *descending {
                    tx.descend_keys(pattern, visit)?;
                } else {
                    tx.ascend_keys(pattern, visit)?;
                }
                Ok::<_, EmberError>(Reply::List(keys))
            }),
            Query::Len => db.view(|tx| tx.len()).map(Reply::Count),
            Query::FlushDb => db.update(|tx| tx.delete_all()).map(|()| Reply::Ok),
            Query::CreateIndex {
                name,
                pattern,
                kind,
                descending,
            } => {
                let less = if *descending {
                    desc(kind.less())
                } else {
                    kind.less()
                };
                db.update(|tx| tx.create_index(name, pattern, vec![less]))
                    .map(|()| Reply::Ok)
            }
            Query::DropIndex(name) => db.update(|tx| tx.drop_index(name)).map(|()| Reply::Ok),
            Query::Indexes => db.view(|tx| tx.indexes()).map(Reply::List),
            Query::Scan { index, descending } => db.view(|tx| {
                let mut pairs = Vec::new();
                let visit = |key: &str, value: &str| {
                    pairs.push((key.to_string(), value.to_string()));
                    true
                };
                if *descending {
                    tx.descend(index, visit)?;
                } else {
                    tx.ascend(index, visit)?;
                }
                Ok::<_, EmberError>(Reply::Pairs(pairs))
            }),
            Query::Shrink => db.shrink().map(|()| Reply::Ok),
            Query::Save(path) => {
                let mut out = BufWriter::new(File::create(path)?);
                db.save(&mut out)?;
                out.flush()?;
                Ok(Reply::Ok)
            }
            Query::Load(path) => db.load(File::open(path)?).map(|()| Reply::Ok),
            Query::Config => {
                let config = db.read_config()?;
                Ok(Reply::Text(format!(
                    "sync={} auto_shrink={} percentage={} min_size={}",
                    config.sync_policy,
                    if config.auto_shrink_disabled { "off" } else { "on" },
                    config.auto_shrink_percentage,
                    config.auto_shrink_min_size
                )))
            }
            Query::ConfigSync(policy) => {
                let mut config = db.read_config()?;
                config.sync_policy = *policy;
                db.set_config(config).map(|()| Reply::Ok)
            }
        }
    }
}

/// Message for an engine error, phrased for the shell.
pub fn describe(error: &EmberError) -> String {
    match error {
        EmberError::NotFound => "(nil)".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_args() {
        assert_eq!(split_args("SET k v").unwrap(), vec!["SET", "k", "v"]);
        assert_eq!(
            split_args(r#"set "two words" "say \"hi\"""#).unwrap(),
            vec!["set", "two words", r#"say "hi""#]
        );
        assert_eq!(split_args(r#"set k """#).unwrap(), vec!["set", "k", ""]);
        assert!(split_args(r#"set "open"#).is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            Query::parse("set k v ex 10").unwrap(),
            Query::Set {
                key: "k".into(),
                value: "v".into(),
                ttl: Some(Duration::from_secs(10)),
            }
        );
        assert_eq!(Query::parse("GET k").unwrap(), Query::Get("k".into()));
        assert_eq!(
            Query::parse("createindex ages user:* int desc").unwrap(),
            Query::CreateIndex {
                name: "ages".into(),
                pattern: "user:*".into(),
                kind: IndexKind::Int,
                descending: true,
            }
        );
        assert_eq!(
            Query::parse("CREATEINDEX last * json:name.last").unwrap(),
            Query::CreateIndex {
                name: "last".into(),
                pattern: "*".into(),
                kind: IndexKind::Json("name.last".into()),
                descending: false,
            }
        );
        assert_eq!(
            Query::parse("scan desc").unwrap(),
            Query::Scan {
                index: String::new(),
                descending: true,
            }
        );
        assert_eq!(
            Query::parse("scan ages").unwrap(),
            Query::Scan {
                index: "ages".into(),
                descending: false,
            }
        );
        assert_eq!(
            Query::parse("config sync always").unwrap(),
            Query::ConfigSync(SyncPolicy::Always)
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(Query::parse("").is_err());
        assert!(Query::parse("GET").is_err());
        assert!(Query::parse("SET k v px 10").is_err());
        assert!(Query::parse("SET k v ex soon").is_err());
        assert!(Query::parse("CREATEINDEX i * weird").is_err());
        assert!(Query::parse("CONFIG SYNC sometimes").is_err());
        assert!(Query::parse("FROB").is_err());
    }

    #[test]
    fn test_execute() {
        let db = Db::open(":memory:").unwrap();
        let run = |line: &str| Query::parse(line).unwrap().execute(&db);

        assert_eq!(run("SET a 2").unwrap(), Reply::Replaced(None));
        assert_eq!(run("SET a 3").unwrap(), Reply::Replaced(Some("2".into())));
        assert_eq!(run("SET b 1 EX 60").unwrap(), Reply::Replaced(None));
        assert_eq!(run("GET a").unwrap(), Reply::Value("3".into()));
        assert_eq!(run("LEN").unwrap(), Reply::Count(2));
        assert_eq!(run("TTL a").unwrap(), Reply::Ttl(None));

        assert_eq!(run("CREATEINDEX vals * int").unwrap(), Reply::Ok);
        assert_eq!(
            run("SCAN vals").unwrap(),
            Reply::Pairs(vec![("b".into(), "1".into()), ("a".into(), "3".into())])
        );
        assert_eq!(run("KEYS * desc").unwrap(), Reply::List(vec!["b".into(), "a".into()]));
        assert_eq!(run("INDEXES").unwrap(), Reply::List(vec!["vals".into()]));

        assert_eq!(run("DEL a").unwrap(), Reply::Value("3".into()));
        assert!(matches!(run("GET a"), Err(EmberError::NotFound)));
        assert_eq!(run("FLUSHDB").unwrap(), Reply::Ok);
        assert_eq!(run("LEN").unwrap(), Reply::Count(0));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("snap.db");
        let snapshot = snapshot.to_str().unwrap();

        let source = Db::open(":memory:").unwrap();
        Query::parse("SET k v").unwrap().execute(&source).unwrap();
        Query::Save(snapshot.into()).execute(&source).unwrap();

        let target = Db::open(":memory:").unwrap();
        Query::Load(snapshot.into()).execute(&target).unwrap();
        assert_eq!(
            Query::Get("k".into()).execute(&target).unwrap(),
            Reply::Value("v".into())
        );
    }
}
