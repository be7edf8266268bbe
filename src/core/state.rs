use crate::core::catalog::{Catalog, Page, Question, Story};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Screen {
    Home,
    StorySelect,
    Story,
    Questions,
    Summary,
}

impl Screen {
    pub fn requires_story(self) -> bool {
        matches!(self, Screen::Story | Screen::Questions | Screen::Summary)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionData {
    pub session_id: String,
    pub selected_theme: Option<String>,
    pub current_page: usize,
    /// question id -> raw answer (option id or free text)
    pub answers: BTreeMap<String, String>,
    pub completed_story: bool,
    pub question_index: usize,
}

impl SessionData {
    fn fresh() -> Self {
        Self {
            session_id: new_session_id(),
            selected_theme: None,
            current_page: 0,
            answers: BTreeMap::new(),
            completed_story: false,
            question_index: 0,
        }
    }
}

pub fn new_session_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTurn {
    Moved(usize),
    /// Past the last page; the session is now on the questions screen.
    Finished,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionStep {
    Next(usize),
    /// All questions answered; the session is now on the summary screen.
    Done,
    NeedsAnswer,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SummaryLine {
    pub question: String,
    pub answer: String,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Summary {
    pub theme: String,
    pub character: String,
    pub answers: Vec<SummaryLine>,
    pub end_message: String,
    pub timestamp: String,
}

impl Summary {
    /// Plain-text session record meant to be pasted into notes.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        text.push_str("【絵本セラピー セッション記録】\n");
        text.push_str(&format!("日時: {}\n\n", self.timestamp));
        text.push_str(&format!("● 読んだ絵本: {}\n", self.theme));
        text.push_str(&format!("● キャラクター: {}\n\n", self.character));
        text.push_str("【キャラクターを通した回答】\n");
        for line in &self.answers {
            text.push_str(&format!("● {}: {}\n", line.question, line.answer));
        }
        text.push_str("\n※ キャラクターへの回答は、本人の気持ちの投影である可能性があります。");
        text
    }
}

const UNANSWERED: &str = "（未回答）";

pub struct Session {
    catalog: Arc<Catalog>,
    screen: Screen,
    data: SessionData,
}

impl Session {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            screen: Screen::Home,
            data: SessionData::fresh(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn data(&self) -> &SessionData {
        &self.data
    }

    pub fn navigate_to(&mut self, screen: Screen) {
        self.screen = screen;
    }

    /// Moves to `screen`, landing on home instead when it needs a story and none is selected.
    pub fn enter(&mut self, screen: Screen) -> Screen {
        self.screen = if screen.requires_story() && self.current_story().is_none() {
            log::debug!("No story selected, redirecting {:?} to home", screen);
            Screen::Home
        } else {
            screen
        };
        self.screen
    }

    pub fn select_theme(&mut self, theme_id: &str) {
        self.data.selected_theme = Some(theme_id.to_string());
        self.data.current_page = 0;
        self.data.answers.clear();
        self.data.completed_story = false;
        self.data.question_index = 0;
    }

    pub fn current_story(&self) -> Option<&Story> {
        self.data
            .selected_theme
            .as_deref()
            .and_then(|id| self.catalog.get(id))
    }

    pub fn current_page(&self) -> Option<&Page> {
        self.current_story()?.page(self.data.current_page)
    }

    pub fn next_page(&mut self) -> PageTurn {
        let Some(last) = self.current_story().map(|s| s.last_page_index()) else {
            return PageTurn::Unchanged;
        };

        if self.data.current_page < last {
            self.data.current_page += 1;
            PageTurn::Moved(self.data.current_page)
        } else {
            self.data.completed_story = true;
            self.data.question_index = 0;
            self.screen = Screen::Questions;
            PageTurn::Finished
        }
    }

    pub fn prev_page(&mut self) -> PageTurn {
        if self.data.current_page > 0 {
            self.data.current_page -= 1;
            PageTurn::Moved(self.data.current_page)
        } else {
            PageTurn::Unchanged
        }
    }

    /// Stores an answer, replacing any earlier one. Blank answers are ignored.
    pub fn save_answer(&mut self, question_id: &str, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        self.data
            .answers
            .insert(question_id.to_string(), value.to_string());
        true
    }

    pub fn answer(&self, question_id: &str) -> Option<&str> {
        self.data.answers.get(question_id).map(String::as_str)
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.current_story()?.questions.get(self.data.question_index)
    }

    pub fn next_question(&mut self) -> QuestionStep {
        let Some(story) = self.current_story() else {
            return QuestionStep::NeedsAnswer;
        };
        let total = story.questions.len();
        let answered = story
            .questions
            .get(self.data.question_index)
            .map(|q| self.data.answers.contains_key(&q.id))
            .unwrap_or(true);

        if !answered {
            return QuestionStep::NeedsAnswer;
        }
        if self.data.question_index + 1 < total {
            self.data.question_index += 1;
            QuestionStep::Next(self.data.question_index)
        } else {
            self.screen = Screen::Summary;
            QuestionStep::Done
        }
    }

    pub fn generate_summary(&self) -> Option<Summary> {
        self.generate_summary_at(Local::now())
    }

    pub fn generate_summary_at(&self, now: DateTime<Local>) -> Option<Summary> {
        let story = self.current_story()?;
        let answers = story
            .questions
            .iter()
            .map(|q| SummaryLine {
                question: q.text.clone(),
                answer: self
                    .answer(&q.id)
                    .map(|a| q.answer_label(a))
                    .unwrap_or_else(|| UNANSWERED.to_string()),
            })
            .collect();

        Some(Summary {
            theme: story.label(),
            character: story.character.clone(),
            answers,
            end_message: story.end_message.clone(),
            timestamp: now.format("%Y/%m/%d %H:%M:%S").to_string(),
        })
    }

    pub fn summary_text(&self) -> Option<String> {
        self.generate_summary().map(|s| s.to_text())
    }

    pub fn reset(&mut self) {
        self.data = SessionData::fresh();
        self.screen = Screen::Home;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session() -> Session {
        Session::new(Arc::new(Catalog::builtin().unwrap()))
    }

    #[test]
    fn test_story_screens_redirect_without_story() {
        let mut s = session();
        assert_eq!(s.enter(Screen::Story), Screen::Home);
        assert_eq!(s.enter(Screen::Summary), Screen::Home);
        assert_eq!(s.enter(Screen::StorySelect), Screen::StorySelect);

        s.select_theme("no-such-story");
        assert!(s.current_story().is_none());
        assert_eq!(s.enter(Screen::Questions), Screen::Home);
        assert!(s.generate_summary().is_none());
        assert_eq!(s.next_page(), PageTurn::Unchanged);
    }

    #[test]
    fn test_page_navigation_bounds() {
        let mut s = session();
        s.select_theme("lonely");
        assert_eq!(s.enter(Screen::Story), Screen::Story);

        assert_eq!(s.prev_page(), PageTurn::Unchanged);
        assert_eq!(s.data().current_page, 0);

        for expected in 1..=4 {
            assert_eq!(s.next_page(), PageTurn::Moved(expected));
        }
        assert!(!s.data().completed_story);
        assert_eq!(s.next_page(), PageTurn::Finished);
        assert!(s.data().completed_story);
        assert_eq!(s.screen(), Screen::Questions);
        assert_eq!(s.data().current_page, 4);

        assert_eq!(s.prev_page(), PageTurn::Moved(3));
    }

    #[test]
    fn test_select_theme_clears_progress() {
        let mut s = session();
        s.select_theme("lonely");
        s.next_page();
        s.save_answer("why", "ひとりだったから");
        s.select_theme("sad");
        assert_eq!(s.data().current_page, 0);
        assert!(s.data().answers.is_empty());
        assert!(!s.data().completed_story);
    }

    #[test]
    fn test_save_answer_last_write_wins_and_ignores_blank() {
        let mut s = session();
        s.select_theme("lonely");
        assert!(s.save_answer("why", "a"));
        assert!(s.save_answer("why", "b"));
        assert!(!s.save_answer("why", "   "));
        assert_eq!(s.answer("why"), Some("b"));
        assert!(!s.save_answer("feeling", ""));
        assert!(s.answer("feeling").is_none());
    }

    #[test]
    fn test_question_cursor() {
        let mut s = session();
        s.select_theme("sad");
        let first = s.current_question().unwrap().id.clone();
        assert_eq!(s.next_question(), QuestionStep::NeedsAnswer);

        s.save_answer(&first, "かなしかったから");
        assert_eq!(s.next_question(), QuestionStep::Next(1));
        let second = s.current_question().unwrap().id.clone();
        s.save_answer(&second, "ないた");
        assert_eq!(s.next_question(), QuestionStep::Next(2));
        s.save_answer("relate", "often");
        assert_eq!(s.next_question(), QuestionStep::Done);
        assert_eq!(s.screen(), Screen::Summary);
    }

    #[test]
    fn test_summary_projection() {
        let mut s = session();
        s.select_theme("sad");
        s.save_answer("why", "たいせつなものをなくしたから");
        s.save_answer("relate", "often");

        let now = Local.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let summary = s.generate_summary_at(now).unwrap();
        let story = s.current_story().unwrap();

        assert_eq!(summary.theme, story.label());
        assert_eq!(summary.character, story.character);
        assert_eq!(summary.timestamp, "2024/05/01 10:30:00");
        assert_eq!(summary.answers.len(), story.questions.len());
        assert_eq!(summary.answers[0].answer, "たいせつなものをなくしたから");
        assert_eq!(summary.answers[1].answer, "（未回答）");
        assert_eq!(summary.answers[2].answer, "😢 よくある");

        let text = summary.to_text();
        assert!(text.starts_with("【絵本セラピー セッション記録】"));
        assert!(text.contains("● 読んだ絵本: "));
        assert!(text.contains("😢 よくある"));
    }

    #[test]
    fn test_reset_starts_new_session() {
        let mut s = session();
        let old_id = s.data().session_id.clone();
        s.select_theme("tired");
        s.navigate_to(Screen::Story);
        s.reset();
        assert_eq!(s.screen(), Screen::Home);
        assert!(s.data().selected_theme.is_none());
        assert_ne!(s.data().session_id, old_id);
    }
}
