/// Message kind — stored as TEXT in the messages table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Private,
    Group,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "PRIVATE",
            Self::Group => "GROUP",
            Self::System => "SYSTEM",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PRIVATE" => Some(Self::Private),
            "GROUP" => Some(Self::Group),
            "SYSTEM" => Some(Self::System),
            _ => None,
        }
    }
}
