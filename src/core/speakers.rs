use serde::Serialize;

/// A VOICEVOX speaker together with the folder its pre-generated audio lives in.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Speaker {
    pub key: &'static str,
    pub id: u32,
    pub name: &'static str,
    pub folder: &'static str,
    pub emoji: &'static str,
}

pub const DEFAULT_SPEAKER: &str = "zundamon";

pub const SPEAKERS: &[Speaker] = &[
    Speaker { key: "zundamon", id: 3, name: "ずんだもん（ノーマル）", folder: "zundamon", emoji: "🟢" },
    Speaker { key: "zundamon_amaama", id: 1, name: "ずんだもん（あまあま）", folder: "zundamon_amaama", emoji: "💚" },
    Speaker { key: "zundamon_tsun", id: 7, name: "ずんだもん（ツンツン）", folder: "zundamon_tsun", emoji: "💢" },
    Speaker { key: "metan", id: 2, name: "四国めたん（ノーマル）", folder: "metan", emoji: "🟣" },
    Speaker { key: "metan_amaama", id: 0, name: "四国めたん（あまあま）", folder: "metan_amaama", emoji: "💜" },
    Speaker { key: "tsumugi", id: 8, name: "春日部つむぎ", folder: "tsumugi", emoji: "🌸" },
    Speaker { key: "ritsu", id: 9, name: "波音リツ", folder: "ritsu", emoji: "🎵" },
    Speaker { key: "himari", id: 14, name: "冥鳴ひまり", folder: "himari", emoji: "🌙" },
    Speaker { key: "sora", id: 16, name: "九州そら（ノーマル）", folder: "sora", emoji: "☁️" },
    Speaker { key: "takehiro", id: 21, name: "剣崎雌雄", folder: "takehiro", emoji: "⚔️" },
    Speaker { key: "whitecul", id: 51, name: "WhiteCUL", folder: "whitecul", emoji: "🤍" },
];

const RECOMMENDED: &[(&str, &str)] = &[
    ("lonely", "metan"),
    ("angry", "zundamon"),
    ("anxious", "tsumugi"),
    ("sad", "metan_amaama"),
    ("tired", "himari"),
    ("confused", "sora"),
];

pub fn find(key: &str) -> Option<&'static Speaker> {
    SPEAKERS.iter().find(|s| s.key == key)
}

/// Looks a speaker up by key, falling back to a raw numeric VOICEVOX id.
pub fn speaker_id(voice: &str) -> Option<u32> {
    find(voice).map(|s| s.id).or_else(|| voice.parse().ok())
}

/// Unknown keys resolve to the default speaker.
pub fn find_or_default(key: &str) -> &'static Speaker {
    find(key).unwrap_or(&SPEAKERS[0])
}

pub fn recommended_for(story_id: &str) -> Option<&'static Speaker> {
    RECOMMENDED
        .iter()
        .find(|(story, _)| *story == story_id)
        .and_then(|(_, key)| find(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaker_lookup() {
        assert_eq!(speaker_id("metan"), Some(2));
        assert_eq!(speaker_id("42"), Some(42));
        assert_eq!(speaker_id("nobody"), None);
        assert_eq!(find_or_default("nobody").key, DEFAULT_SPEAKER);
        assert_eq!(recommended_for("tired").unwrap().folder, "himari");
        assert!(recommended_for("unknown").is_none());
    }
}
