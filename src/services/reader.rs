//! Interactive terminal front-end for a reading session.

use crate::core::catalog::{Question, Story};
use crate::core::speakers::{self, Speaker};
use crate::core::state::{PageTurn, QuestionStep, Screen, Session};
use crate::services::assets::{AssetResolver, AssetStatus};
use crate::services::logclient::LogClient;
use crate::services::queue::{GenerationQueue, QueueHandle};
use crate::services::tts::{TtsDispatcher, TtsEngine};
use anyhow::{Context, Result};
use inquire::error::InquireError;
use inquire::{Select, Text};
use log::{debug, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A menu entry shown by `inquire::Select`.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice<T> {
    pub value: T,
    pub label: String,
}

impl<T> Choice<T> {
    fn new(value: T, label: impl Into<String>) -> Self {
        Self {
            value,
            label: label.into(),
        }
    }
}

impl<T> fmt::Display for Choice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAction {
    Next,
    Prev,
    Read,
    ToggleAutoRead,
    Regenerate,
    DeleteImage,
    ChangeVoice,
    Home,
}

/// Actions offered on a story page, in menu order.
pub fn page_actions(
    page_index: usize,
    last_page: usize,
    auto_read: bool,
    images_configured: bool,
    has_cached_image: bool,
) -> Vec<Choice<PageAction>> {
    let mut actions = Vec::new();
    let next = if page_index >= last_page { "➡️ おわり（質問へ）" } else { "➡️ つぎへ" };
    actions.push(Choice::new(PageAction::Next, next));
    if page_index > 0 {
        actions.push(Choice::new(PageAction::Prev, "⬅️ まえへ"));
    }
    actions.push(Choice::new(PageAction::Read, "🔊 読み上げ"));
    let auto = if auto_read { "🔁 自動読み上げ: ON" } else { "🔁 自動読み上げ: OFF" };
    actions.push(Choice::new(PageAction::ToggleAutoRead, auto));
    if images_configured {
        actions.push(Choice::new(PageAction::Regenerate, "🎨 画像を再生成"));
    }
    if has_cached_image {
        actions.push(Choice::new(PageAction::DeleteImage, "🗑️ 画像を削除"));
    }
    actions.push(Choice::new(PageAction::ChangeVoice, "🎙️ 声をかえる"));
    actions.push(Choice::new(PageAction::Home, "🏠 ホームへ"));
    actions
}

/// Page header, text and media status as printed to the terminal.
pub fn render_page(story: &Story, page_index: usize, status: &AssetStatus, generation: Option<(usize, usize)>) -> String {
    let total = story.pages.len();
    let text = story.page(page_index).map(|p| p.text.as_str()).unwrap_or_default();
    let image = match (&status.image_path, status.has_image) {
        (Some(path), _) => format!("🖼️ {}", path),
        (None, true) => "🖼️ 生成済み".to_string(),
        (None, false) => "🖼️ なし".to_string(),
    };
    let audio = match &status.audio_path {
        Some(path) => format!("🔈 {}", path),
        None => "🔈 音声合成".to_string(),
    };

    let mut out = format!(
        "\n{}  ({}/{})\n\n  {}\n\n  {}   {}",
        story.label(),
        page_index + 1,
        total,
        text,
        image,
        audio
    );
    if let Some((done, total)) = generation {
        if done < total {
            out.push_str(&format!("\n  🎨 画像を準備中... {}/{}", done, total));
        }
    }
    out
}

/// Options render as `emoji label` and carry the option id.
pub fn answer_choices(question: &Question) -> Vec<Choice<String>> {
    question
        .options
        .iter()
        .map(|o| Choice::new(o.id.clone(), format!("{} {}", o.emoji, o.label)))
        .collect()
}

fn is_cancel(e: &InquireError) -> bool {
    matches!(
        e,
        InquireError::OperationCanceled | InquireError::OperationInterrupted
    )
}

/// `Ok(None)` when the prompt was cancelled with Esc or Ctrl-C.
fn prompt<T>(result: Result<T, InquireError>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if is_cancel(&e) => Ok(None),
        Err(e) => Err(e).context("Prompt failed"),
    }
}

pub struct Reader {
    session: Session,
    tts: Arc<TtsDispatcher>,
    assets: Arc<AssetResolver>,
    queue: GenerationQueue,
    logs: Option<LogClient>,
    summary_dir: PathBuf,
    auto_read: bool,
    narration: Option<JoinHandle<()>>,
    generation: Option<QueueHandle>,
    logged_page: Option<usize>,
}

impl Reader {
    pub fn new(
        session: Session,
        tts: Arc<TtsDispatcher>,
        assets: Arc<AssetResolver>,
        queue: GenerationQueue,
        logs: Option<LogClient>,
        summary_dir: PathBuf,
    ) -> Self {
        Self {
            session,
            tts,
            assets,
            queue,
            logs,
            summary_dir,
            auto_read: true,
            narration: None,
            generation: None,
            logged_page: None,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let selection = self.tts.resolve_engine().await?;
        if let Some(from) = selection.fallback_from {
            println!("⚠️ {} が使えないため {} に切り替えました", from.display_name(), selection.engine.display_name());
        }
        self.log_session_start().await;

        loop {
            let screen = self.session.enter(self.session.screen());
            let keep_going = match screen {
                Screen::Home => self.home()?,
                Screen::StorySelect => self.select_story().await?,
                Screen::Story => self.story_page().await?,
                Screen::Questions => self.questions().await?,
                Screen::Summary => self.summary().await?,
            };
            if !keep_going {
                break;
            }
        }

        self.leave_story();
        println!("またね 👋");
        Ok(())
    }

    fn speaker(&self) -> &'static Speaker {
        self.session
            .current_story()
            .and_then(|s| speakers::recommended_for(&s.id))
            .unwrap_or_else(|| speakers::find_or_default(speakers::DEFAULT_SPEAKER))
    }

    async fn log_session_start(&self) {
        if let Some(logs) = &self.logs {
            logs.session_start().await;
        }
    }

    fn new_session(&mut self) {
        self.leave_story();
        self.session.reset();
        if let Some(logs) = &mut self.logs {
            logs.set_session_id(self.session.data().session_id.clone());
        }
    }

    /// Stops narration and background generation for the current story.
    fn leave_story(&mut self) {
        self.stop_narration();
        if let Some(handle) = self.generation.take() {
            handle.cancel();
        }
        self.logged_page = None;
    }

    fn stop_narration(&mut self) {
        self.tts.stop_speaking();
        if let Some(task) = self.narration.take() {
            task.abort();
        }
    }

    fn start_narration(&mut self) {
        let Some(text) = self.session.current_page().map(|p| p.text.clone()) else {
            return;
        };
        self.stop_narration();
        let tts = self.tts.clone();
        self.narration = Some(tokio::spawn(async move {
            if let Err(e) = tts.speak(&text, None).await {
                warn!("Narration failed: {}", e);
                eprintln!("⚠️ 音声エラー: {}", e);
            }
        }));
    }

    fn home(&mut self) -> Result<bool> {
        println!("\n📚 えほんセラピー\nきょうの気持ちに あう絵本を いっしょに読もう");
        let choices = vec![Choice::new(true, "📖 はじめる"), Choice::new(false, "👋 おわる")];
        match prompt(Select::new("どうする？", choices).prompt())? {
            Some(c) if c.value => {
                self.session.navigate_to(Screen::StorySelect);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn select_story(&mut self) -> Result<bool> {
        let mut choices: Vec<Choice<Option<String>>> = self
            .session
            .catalog()
            .stories()
            .iter()
            .map(|s| Choice::new(Some(s.id.clone()), format!("{}  {}", s.label(), s.description)))
            .collect();
        choices.push(Choice::new(None, "🏠 もどる"));

        match prompt(Select::new("きょうは どんな気持ち？", choices).prompt())? {
            Some(Choice { value: Some(id), .. }) => {
                self.session.select_theme(&id);
                self.session.navigate_to(Screen::Story);
                self.start_generation().await;
            }
            _ => self.session.navigate_to(Screen::Home),
        }
        Ok(true)
    }

    async fn start_generation(&mut self) {
        if !self.assets.on_demand.is_configured() {
            debug!("Image generation not configured, skipping background queue");
            return;
        }
        let Some(story) = self.session.current_story().cloned() else {
            return;
        };
        match self.queue.start(&story).await {
            Ok(handle) => self.generation = Some(handle),
            Err(e) => warn!("Could not start background generation: {}", e),
        }
    }

    async fn story_page(&mut self) -> Result<bool> {
        let Some(story) = self.session.current_story().cloned() else {
            return Ok(true);
        };
        let index = self.session.data().current_page;
        let status = self.assets.resolve(&story.id, index, self.speaker()).await;
        let progress = self.generation.as_ref().map(|h| {
            let p = *h.progress().borrow();
            (p.completed, p.total)
        });

        if self.logged_page != Some(index) {
            self.logged_page = Some(index);
            if let Some(logs) = &self.logs {
                logs.page_view(&story.id, index).await;
            }
            println!("{}", render_page(&story, index, &status, progress));
            if self.auto_read {
                self.start_narration();
            }
        }

        let has_cached = self
            .assets
            .on_demand
            .has_image(&story.id, index)
            .await
            .unwrap_or(false);
        let actions = page_actions(
            index,
            story.last_page_index(),
            self.auto_read,
            self.assets.on_demand.is_configured(),
            has_cached,
        );
        let Some(action) = prompt(Select::new("", actions).prompt())? else {
            self.leave_story();
            self.session.navigate_to(Screen::Home);
            return Ok(true);
        };

        match action.value {
            PageAction::Next => {
                self.stop_narration();
                if self.session.next_page() == PageTurn::Finished {
                    if let Some(logs) = &self.logs {
                        logs.story_complete(&story.id).await;
                    }
                    self.leave_story();
                }
            }
            PageAction::Prev => {
                self.stop_narration();
                self.session.prev_page();
            }
            PageAction::Read => {
                if self.tts.is_speaking() {
                    self.stop_narration();
                } else {
                    self.start_narration();
                }
            }
            PageAction::ToggleAutoRead => self.auto_read = !self.auto_read,
            PageAction::Regenerate => {
                println!("🎨 画像を生成しています...");
                match self.assets.on_demand.regenerate(&story, index).await {
                    Ok(image) => println!("✅ 画像を生成しました ({}, {} bytes)", image.mime_type, image.data.len()),
                    Err(e) => println!("⚠️ 画像の生成に失敗しました: {}", e),
                }
            }
            PageAction::DeleteImage => match self.assets.on_demand.delete(&story.id, index).await {
                Ok(()) => println!("🗑️ 画像を削除しました"),
                Err(e) => println!("⚠️ 画像を削除できませんでした: {}", e),
            },
            PageAction::ChangeVoice => self.change_voice().await?,
            PageAction::Home => {
                self.leave_story();
                self.session.navigate_to(Screen::Home);
            }
        }
        Ok(true)
    }

    async fn change_voice(&mut self) -> Result<()> {
        let current = self.tts.settings();
        let engines: Vec<Choice<TtsEngine>> = self
            .tts
            .available_engines()
            .await
            .into_iter()
            .map(|e| {
                let mark = if e == current.engine { " ✓" } else { "" };
                Choice::new(e, format!("{}{}", e.display_name(), mark))
            })
            .collect();
        let Some(engine) = prompt(Select::new("音声エンジン", engines).prompt())? else {
            return Ok(());
        };

        let voices = match self.tts.voices(engine.value).await {
            Ok(v) => v,
            Err(e) => {
                println!("⚠️ 声の一覧を取得できませんでした: {}", e);
                Vec::new()
            }
        };
        let voice = if voices.is_empty() {
            None
        } else {
            let choices: Vec<Choice<String>> = voices.into_iter().map(|v| Choice::new(v.id, v.name)).collect();
            match prompt(Select::new("声", choices).prompt())? {
                Some(c) => Some(c.value),
                None => return Ok(()),
            }
        };

        self.tts.set_engine(engine.value, voice.as_deref()).await?;
        let settings = self.tts.settings();
        println!("🎙️ {} / {}", settings.engine.display_name(), settings.voice);
        Ok(())
    }

    async fn questions(&mut self) -> Result<bool> {
        let Some(story) = self.session.current_story().cloned() else {
            return Ok(true);
        };
        let Some(question) = self.session.current_question().cloned() else {
            // No questions for this story.
            self.session.navigate_to(Screen::Summary);
            return Ok(true);
        };
        let index = self.session.data().question_index;
        println!("\n💭 {} ({}/{})", story.character, index + 1, story.questions.len());

        let answer = if question.is_free_text() {
            let mut text = Text::new(&question.text);
            if let Some(previous) = self.session.answer(&question.id) {
                text = text.with_initial_value(previous);
            }
            prompt(text.prompt())?
        } else {
            prompt(Select::new(&question.text, answer_choices(&question)).prompt())?.map(|c| c.value)
        };
        let Some(answer) = answer else {
            self.new_session();
            return Ok(true);
        };

        if self.session.save_answer(&question.id, &answer) {
            if let Some(logs) = &self.logs {
                logs.answer(&story.id, index, answer.trim()).await;
            }
        }
        if self.session.next_question() == QuestionStep::NeedsAnswer {
            println!("✏️ こたえを入力してね");
        }
        Ok(true)
    }

    async fn summary(&mut self) -> Result<bool> {
        let Some(summary) = self.session.generate_summary() else {
            return Ok(true);
        };
        println!("\n🌈 {}\n", summary.end_message);
        println!("{}", summary.to_text());

        let choices = vec![
            Choice::new(0, "📚 ほかの絵本を読む"),
            Choice::new(1, "📋 記録を保存する"),
            Choice::new(2, "🏠 おわる"),
        ];
        match prompt(Select::new("つぎは？", choices).prompt())?.map(|c| c.value) {
            Some(0) => {
                self.new_session();
                self.log_session_start().await;
                self.session.navigate_to(Screen::StorySelect);
            }
            Some(1) => {
                let path = self
                    .summary_dir
                    .join(format!("summary_{}.txt", self.session.data().session_id));
                tokio::fs::create_dir_all(&self.summary_dir).await?;
                tokio::fs::write(&path, summary.to_text())
                    .await
                    .with_context(|| format!("Failed to write {:?}", path))?;
                println!("📋 保存しました: {}", path.display());
            }
            _ => {
                self.new_session();
            }
        }
        Ok(true)
    }
}
