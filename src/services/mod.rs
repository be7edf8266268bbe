pub mod admin;
pub mod assets;
pub mod imagegen;
pub mod logclient;
pub mod pregen;
pub mod queue;
pub mod reader;
pub mod tts;
