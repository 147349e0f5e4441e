use serde::{Deserialize, Serialize};

/// Server-assigned conversation identifier
pub type ChatId = i64;

/// Kind of payload carried by a file message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    Image,
    Video,
    File,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Image => "IMAGE",
            FileType::Video => "VIDEO",
            FileType::File => "FILE",
        }
    }
}

impl std::str::FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IMAGE" => Ok(FileType::Image),
            "VIDEO" => Ok(FileType::Video),
            "FILE" => Ok(FileType::File),
            other => Err(format!("unknown file type: {other}")),
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
