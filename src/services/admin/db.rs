use crate::core::catalog::Catalog;
use crate::core::speakers::DEFAULT_SPEAKER;
use anyhow::{Context, Result};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS stories (
        id TEXT PRIMARY KEY,
        emoji TEXT,
        title TEXT NOT NULL,
        description TEXT,
        theme TEXT,
        speaker TEXT DEFAULT 'zundamon',
        pages TEXT NOT NULL,
        questions TEXT,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS access_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT,
        type TEXT NOT NULL,
        story_id TEXT,
        page_index INTEGER,
        data TEXT,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS stats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        date TEXT NOT NULL,
        story_id TEXT,
        page_index INTEGER,
        views INTEGER DEFAULT 0,
        UNIQUE(date, story_id, page_index)
    );

    CREATE TABLE IF NOT EXISTS answers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        story_id TEXT NOT NULL,
        question_index INTEGER,
        answer TEXT,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );
";

/// A row of the `stories` table with its JSON columns parsed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoryRecord {
    pub id: String,
    pub emoji: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub theme: Option<String>,
    pub speaker: String,
    pub pages: Vec<Value>,
    pub questions: Vec<Value>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Body of story create/update requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoryInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub pages: Vec<Value>,
    #[serde(default)]
    pub questions: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub story_id: Option<String>,
    #[serde(default)]
    pub page_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogRecord {
    pub id: i64,
    pub session_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub story_id: Option<String>,
    pub page_index: Option<i64>,
    pub data: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerEntry {
    pub session_id: String,
    pub story_id: String,
    #[serde(default)]
    pub question_index: Option<i64>,
    #[serde(default)]
    pub answer: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnswerRecord {
    pub id: i64,
    pub session_id: String,
    pub story_id: String,
    pub question_index: Option<i64>,
    pub answer: Option<String>,
    pub created_at: String,
    pub story_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoryViews {
    pub id: String,
    pub title: String,
    pub emoji: Option<String>,
    pub views: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PageViews {
    pub story_id: Option<String>,
    pub story_title: Option<String>,
    pub page_index: Option<i64>,
    pub views: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DailyStats {
    pub date: String,
    pub views: i64,
    pub sessions: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub story_ranking: Vec<StoryViews>,
    pub page_ranking: Vec<PageViews>,
    pub daily_stats: Vec<DailyStats>,
    pub total_views: i64,
}

/// The admin SQLite database. Every statement runs under one connection lock.
pub struct Database {
    conn: Mutex<Connection>,
}

fn parse_json_list(raw: Option<String>) -> Vec<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn story_from_row(row: &Row) -> rusqlite::Result<StoryRecord> {
    let speaker: Option<String> = row.get("speaker")?;
    Ok(StoryRecord {
        id: row.get("id")?,
        emoji: row.get("emoji")?,
        title: row.get("title")?,
        description: row.get("description")?,
        theme: row.get("theme")?,
        speaker: speaker.unwrap_or_else(|| DEFAULT_SPEAKER.to_string()),
        pages: parse_json_list(row.get("pages")?),
        questions: parse_json_list(row.get("questions")?),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn to_json(values: &[Value]) -> String {
    Value::Array(values.to_vec()).to_string()
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database folder {:?}", parent))?;
        }
        let conn = Connection::open(path).with_context(|| format!("Failed to open database {:?}", path))?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("SQLite journal mode: {}", mode);
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("Failed to create admin tables")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts catalog stories that are not in the table yet. Edited rows are left alone.
    pub fn seed(&self, catalog: &Catalog) -> Result<usize> {
        let conn = self.conn();
        let mut inserted = 0;
        for story in catalog.stories() {
            let pages = serde_json::to_string(&story.pages)?;
            let questions = serde_json::to_string(&story.questions)?;
            inserted += conn.execute(
                "INSERT OR IGNORE INTO stories (id, emoji, title, description, theme, pages, questions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![story.id, story.emoji, story.title, story.description, story.theme, pages, questions],
            )?;
        }
        if inserted > 0 {
            info!("Seeded {} stories into the admin database", inserted);
        }
        Ok(inserted)
    }

    pub fn stories(&self) -> Result<Vec<StoryRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM stories ORDER BY created_at, rowid")?;
        let rows = stmt.query_map([], story_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn story(&self, id: &str) -> Result<Option<StoryRecord>> {
        let conn = self.conn();
        let story = conn
            .query_row("SELECT * FROM stories WHERE id = ?1", params![id], story_from_row)
            .optional()?;
        Ok(story)
    }

    pub fn insert_story(&self, id: &str, input: &StoryInput) -> Result<()> {
        self.conn().execute(
            "INSERT INTO stories (id, emoji, title, description, theme, pages, questions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                input.emoji,
                input.title,
                input.description,
                input.theme,
                to_json(&input.pages),
                to_json(&input.questions)
            ],
        )?;
        Ok(())
    }

    /// Returns false when no story has that id.
    pub fn update_story(&self, id: &str, input: &StoryInput) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE stories SET emoji = ?1, title = ?2, description = ?3, theme = ?4,
             pages = ?5, questions = ?6, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?7",
            params![
                input.emoji,
                input.title,
                input.description,
                input.theme,
                to_json(&input.pages),
                to_json(&input.questions),
                id
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_story(&self, id: &str) -> Result<bool> {
        let changed = self.conn().execute("DELETE FROM stories WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn set_speaker(&self, id: &str, speaker: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE stories SET speaker = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![speaker, id],
        )?;
        Ok(changed > 0)
    }

    /// Records a log entry. A `page_view` with a story also bumps that page's views for `date`.
    pub fn record_log(&self, entry: &LogEntry, date: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let data = entry.data.as_ref().map(Value::to_string);
        tx.execute(
            "INSERT INTO access_logs (session_id, type, story_id, page_index, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entry.session_id, entry.kind, entry.story_id, entry.page_index, data],
        )?;

        if entry.kind == "page_view" {
            if let Some(story_id) = &entry.story_id {
                let page_index = entry.page_index.unwrap_or(0);
                tx.execute(
                    "INSERT INTO stats (date, story_id, page_index, views) VALUES (?1, ?2, ?3, 1)
                     ON CONFLICT(date, story_id, page_index) DO UPDATE SET views = views + 1",
                    params![date, story_id, page_index],
                )?;
                debug!("page_view {}/{} on {}", story_id, page_index, date);
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn logs(&self, limit: u32) -> Result<Vec<LogRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, type, story_id, page_index, data, created_at
             FROM access_logs ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                kind: row.get(2)?,
                story_id: row.get(3)?,
                page_index: row.get(4)?,
                data: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn record_answer(&self, entry: &AnswerEntry) -> Result<()> {
        self.conn().execute(
            "INSERT INTO answers (session_id, story_id, question_index, answer) VALUES (?1, ?2, ?3, ?4)",
            params![entry.session_id, entry.story_id, entry.question_index, entry.answer],
        )?;
        Ok(())
    }

    pub fn answers(&self, limit: u32) -> Result<Vec<AnswerRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.session_id, a.story_id, a.question_index, a.answer, a.created_at,
                    s.title AS story_title
             FROM answers a
             LEFT JOIN stories s ON a.story_id = s.id
             ORDER BY a.created_at DESC, a.id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(AnswerRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                story_id: row.get(2)?,
                question_index: row.get(3)?,
                answer: row.get(4)?,
                created_at: row.get(5)?,
                story_title: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn stats(&self) -> Result<Stats> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT s.id, s.title, s.emoji, COALESCE(SUM(st.views), 0) AS views
             FROM stories s
             LEFT JOIN stats st ON s.id = st.story_id
             GROUP BY s.id
             ORDER BY views DESC, s.rowid",
        )?;
        let story_ranking = stmt
            .query_map([], |row| {
                Ok(StoryViews {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    emoji: row.get(2)?,
                    views: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT st.story_id, s.title AS story_title, st.page_index, SUM(st.views) AS views
             FROM stats st
             LEFT JOIN stories s ON st.story_id = s.id
             GROUP BY st.story_id, st.page_index
             ORDER BY views DESC
             LIMIT 20",
        )?;
        let page_ranking = stmt
            .query_map([], |row| {
                Ok(PageViews {
                    story_id: row.get(0)?,
                    story_title: row.get(1)?,
                    page_index: row.get(2)?,
                    views: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT date, SUM(views) AS views,
                    (SELECT COUNT(DISTINCT session_id) FROM access_logs
                     WHERE DATE(created_at) = stats.date) AS sessions
             FROM stats
             GROUP BY date
             ORDER BY date DESC
             LIMIT 30",
        )?;
        let daily_stats = stmt
            .query_map([], |row| {
                Ok(DailyStats {
                    date: row.get(0)?,
                    views: row.get(1)?,
                    sessions: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let total_views = conn.query_row("SELECT COALESCE(SUM(views), 0) FROM stats", [], |row| row.get(0))?;

        Ok(Stats {
            story_ranking,
            page_ranking,
            daily_stats,
            total_views,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.seed(&Catalog::builtin().unwrap()).unwrap();
        db
    }

    fn page_view(session: &str, story: &str, page: i64) -> LogEntry {
        LogEntry {
            session_id: Some(session.to_string()),
            kind: "page_view".to_string(),
            story_id: Some(story.to_string()),
            page_index: Some(page),
            data: None,
        }
    }

    #[test]
    fn test_seed_is_idempotent_and_keeps_edits() {
        let db = seeded();
        let catalog = Catalog::builtin().unwrap();
        assert_eq!(db.stories().unwrap().len(), catalog.stories().len());

        db.set_speaker("sad", "himari").unwrap();
        assert_eq!(db.seed(&catalog).unwrap(), 0);

        let sad = db.story("sad").unwrap().unwrap();
        assert_eq!(sad.speaker, "himari");
        assert_eq!(sad.pages.len(), 5);
        assert_eq!(sad.pages[0]["text"], catalog.get("sad").unwrap().pages[0].text.as_str());
        assert_eq!(db.story("lonely").unwrap().unwrap().speaker, DEFAULT_SPEAKER);
    }

    #[test]
    fn test_story_crud() {
        let db = Database::open_in_memory().unwrap();
        let input = StoryInput {
            emoji: Some("🐢".to_string()),
            title: "のんびりかめ".to_string(),
            pages: vec![serde_json::json!({"text": "かめはゆっくり歩きました。"})],
            ..StoryInput::default()
        };
        db.insert_story("turtle", &input).unwrap();
        assert!(db.insert_story("turtle", &input).is_err());

        let updated = StoryInput {
            title: "はやいかめ".to_string(),
            ..input.clone()
        };
        assert!(db.update_story("turtle", &updated).unwrap());
        assert!(!db.update_story("nobody", &updated).unwrap());
        assert_eq!(db.story("turtle").unwrap().unwrap().title, "はやいかめ");

        assert!(db.delete_story("turtle").unwrap());
        assert!(db.story("turtle").unwrap().is_none());
        assert!(!db.delete_story("turtle").unwrap());
    }

    #[test]
    fn test_page_views_accumulate_per_day() {
        let db = seeded();
        db.record_log(&page_view("a", "lonely", 0), "2026-01-01").unwrap();
        db.record_log(&page_view("b", "lonely", 0), "2026-01-01").unwrap();
        db.record_log(&page_view("a", "lonely", 1), "2026-01-01").unwrap();
        db.record_log(&page_view("a", "angry", 0), "2026-01-02").unwrap();
        db.record_log(
            &LogEntry {
                kind: "session_start".to_string(),
                session_id: Some("a".to_string()),
                ..LogEntry::default()
            },
            "2026-01-01",
        )
        .unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.total_views, 4);
        assert_eq!(stats.story_ranking[0].id, "lonely");
        assert_eq!(stats.story_ranking[0].views, 3);
        assert_eq!(stats.story_ranking.len(), 6);
        assert_eq!(
            stats.page_ranking[0],
            PageViews {
                story_id: Some("lonely".to_string()),
                story_title: Some("ひとりぼっちのうさぎ".to_string()),
                page_index: Some(0),
                views: 2,
            }
        );
        let dates: Vec<&str> = stats.daily_stats.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(dates, vec!["2026-01-02", "2026-01-01"]);
        assert_eq!(db.logs(100).unwrap().len(), 5);
        assert_eq!(db.logs(2).unwrap().len(), 2);
    }

    #[test]
    fn test_daily_sessions_count_distinct_ids() {
        let db = seeded();
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        db.record_log(&page_view("a", "sad", 0), &today).unwrap();
        db.record_log(&page_view("a", "sad", 1), &today).unwrap();
        db.record_log(&page_view("b", "sad", 0), &today).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(
            stats.daily_stats,
            vec![DailyStats {
                date: today,
                views: 3,
                sessions: 2
            }]
        );
    }

    #[test]
    fn test_answers_join_story_title() {
        let db = seeded();
        db.record_answer(&AnswerEntry {
            session_id: "s1".to_string(),
            story_id: "tired".to_string(),
            question_index: Some(0),
            answer: Some("がんばりすぎたから".to_string()),
        })
        .unwrap();
        db.record_answer(&AnswerEntry {
            session_id: "s1".to_string(),
            story_id: "ghost".to_string(),
            question_index: None,
            answer: None,
        })
        .unwrap();

        let answers = db.answers(100).unwrap();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].story_id, "ghost");
        assert_eq!(answers[0].story_title, None);
        assert_eq!(answers[1].story_title.as_deref(), Some("つかれたわんこ"));
        assert_eq!(answers[1].answer.as_deref(), Some("がんばりすぎたから"));
    }
}
