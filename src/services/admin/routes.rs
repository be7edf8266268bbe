use super::db::{AnswerEntry, LogEntry, StoryInput, StoryRecord};
use super::{AdminState, ApiError};
use crate::core::speakers::{self, SPEAKERS};
use crate::services::assets::{AssetStatus, SpeakerRef};
use axum::extract::{Path, Query, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tower_http::cors::CorsLayer;

const DEFAULT_LIMIT: u32 = 100;

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/api/speakers", get(list_speakers))
        .route("/api/assets/status", get(asset_status))
        .route("/api/stories", get(list_stories).post(create_story))
        .route(
            "/api/stories/{id}",
            get(get_story).put(update_story).delete(delete_story),
        )
        .route("/api/stories/{id}/speaker", put(set_speaker))
        .route("/api/logs", get(list_logs).post(record_log))
        .route("/api/answers", get(list_answers).post(record_answer))
        .route("/api/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<String>,
}

impl LimitQuery {
    /// Missing, zero or unparsable limits fall back to the default.
    fn limit(&self) -> u32 {
        self.limit
            .as_deref()
            .and_then(|l| l.trim().parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_LIMIT)
    }
}

fn success() -> Json<Value> {
    Json(json!({ "success": true }))
}

// --- assets ---

#[derive(Serialize)]
struct SpeakerInfo {
    id: u32,
    name: &'static str,
    folder: &'static str,
}

async fn list_speakers() -> Json<BTreeMap<&'static str, SpeakerInfo>> {
    Json(
        SPEAKERS
            .iter()
            .map(|s| {
                (
                    s.key,
                    SpeakerInfo {
                        id: s.id,
                        name: s.name,
                        folder: s.folder,
                    },
                )
            })
            .collect(),
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoryAssets {
    id: String,
    title: String,
    emoji: Option<String>,
    speaker: String,
    speaker_name: &'static str,
    available_speakers: Vec<SpeakerRef>,
    pages: Vec<AssetStatus>,
}

async fn asset_status(State(state): State<AdminState>) -> ApiResult<BTreeMap<String, StoryAssets>> {
    let stories = state.db.stories()?;
    let mut status = BTreeMap::new();
    for story in stories {
        let speaker = speakers::find_or_default(&story.speaker);
        let available_speakers = state
            .assets
            .available_speakers(&story.id)
            .await
            .into_iter()
            .map(SpeakerRef::from)
            .collect();
        let pages = state.assets.story_status(&story.id, story.pages.len(), speaker).await;

        status.insert(
            story.id.clone(),
            StoryAssets {
                id: story.id,
                title: story.title,
                emoji: story.emoji,
                speaker: story.speaker,
                speaker_name: speaker.name,
                available_speakers,
                pages,
            },
        );
    }
    Ok(Json(status))
}

#[derive(Deserialize)]
struct SpeakerUpdate {
    #[serde(default)]
    speaker: String,
}

async fn set_speaker(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<SpeakerUpdate>,
) -> ApiResult<Value> {
    if speakers::find(&body.speaker).is_none() {
        return Err(ApiError::bad_request("Unknown speaker"));
    }
    state.db.set_speaker(&id, &body.speaker)?;
    Ok(Json(json!({ "success": true, "speaker": body.speaker })))
}

// --- stories ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoryListing {
    #[serde(flatten)]
    story: StoryRecord,
    speaker_name: String,
}

async fn list_stories(State(state): State<AdminState>) -> ApiResult<BTreeMap<String, StoryListing>> {
    let stories = state
        .db
        .stories()?
        .into_iter()
        .map(|story| {
            let speaker_name = speakers::find(&story.speaker)
                .map(|s| s.name.to_string())
                .unwrap_or_else(|| story.speaker.clone());
            (story.id.clone(), StoryListing { story, speaker_name })
        })
        .collect();
    Ok(Json(stories))
}

async fn get_story(State(state): State<AdminState>, Path(id): Path<String>) -> ApiResult<StoryRecord> {
    state
        .db
        .story(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Story not found"))
}

async fn create_story(State(state): State<AdminState>, Json(input): Json<StoryInput>) -> ApiResult<Value> {
    let id = input
        .id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("story_{}", chrono::Utc::now().timestamp_millis()));
    if state.db.story(&id)?.is_some() {
        return Err(ApiError::bad_request("Story already exists"));
    }
    state.db.insert_story(&id, &input)?;
    Ok(Json(json!({ "id": id, "success": true })))
}

async fn update_story(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(input): Json<StoryInput>,
) -> ApiResult<Value> {
    state.db.update_story(&id, &input)?;
    Ok(success())
}

async fn delete_story(State(state): State<AdminState>, Path(id): Path<String>) -> ApiResult<Value> {
    state.db.delete_story(&id)?;
    Ok(success())
}

// --- logs, answers, stats ---

async fn record_log(State(state): State<AdminState>, Json(entry): Json<LogEntry>) -> ApiResult<Value> {
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    state.db.record_log(&entry, &today)?;
    Ok(success())
}

async fn list_logs(
    State(state): State<AdminState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<super::db::LogRecord>> {
    Ok(Json(state.db.logs(query.limit())?))
}

async fn record_answer(State(state): State<AdminState>, Json(entry): Json<AnswerEntry>) -> ApiResult<Value> {
    state.db.record_answer(&entry)?;
    Ok(success())
}

async fn list_answers(
    State(state): State<AdminState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<super::db::AnswerRecord>> {
    Ok(Json(state.db.answers(query.limit())?))
}

async fn stats(State(state): State<AdminState>) -> ApiResult<super::db::Stats> {
    Ok(Json(state.db.stats()?))
}
