use std::str::FromStr;

use uuid::Uuid;

/// Text frames a client may send on a room socket, parsed at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Plain text message
    Say { text: String },
    /// `/reply <messageId> <text>`
    Reply { reply_to: Uuid, text: String },
    /// `/react <messageId> <emoji>`
    React { message_id: Uuid, emoji: String },
    /// `/unreact <messageId>`
    Unreact { message_id: Uuid },
    /// `/unsend <messageId>`
    Unsend { message_id: Uuid },
    /// `/sticker <stickerId>`
    Sticker { sticker_id: Uuid },
    /// `/read <messageId>`
    Read { message_id: Uuid },
    /// `/leave`
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("message is empty")]
    Empty,
    #[error("unknown command: /{0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid id: {0}")]
    InvalidId(String),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Empty => "empty_message",
            Self::Unknown(_) => "unknown_command",
            Self::Usage(_) => "bad_command",
            Self::InvalidId(_) => "invalid_id",
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid, CommandError> {
    Uuid::parse_str(raw).map_err(|_| CommandError::InvalidId(raw.to_string()))
}

/// Splits off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

impl FromStr for ClientCommand {
    type Err = CommandError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let input = raw.trim();
        if input.is_empty() {
            return Err(CommandError::Empty);
        }

        let Some(rest) = input.strip_prefix('/') else {
            return Ok(Self::Say {
                text: input.to_string(),
            });
        };

        let (name, args) = split_word(rest);
        match name {
            "reply" => {
                let (id, text) = split_word(args);
                if id.is_empty() || text.is_empty() {
                    return Err(CommandError::Usage("/reply <messageId> <text>"));
                }
                Ok(Self::Reply {
                    reply_to: parse_id(id)?,
                    text: text.to_string(),
                })
            }
            "react" => {
                let (id, emoji) = split_word(args);
                if id.is_empty() || emoji.is_empty() || emoji.contains(char::is_whitespace) {
                    return Err(CommandError::Usage("/react <messageId> <emoji>"));
                }
                Ok(Self::React {
                    message_id: parse_id(id)?,
                    emoji: emoji.to_string(),
                })
            }
            "unsend" | "unreact" | "sticker" | "read" => {
                let (id, extra) = split_word(args);
                if id.is_empty() || !extra.is_empty() {
                    return Err(CommandError::Usage(match name {
                        "unsend" => "/unsend <messageId>",
                        "unreact" => "/unreact <messageId>",
                        "sticker" => "/sticker <stickerId>",
                        _ => "/read <messageId>",
                    }));
                }
                let id = parse_id(id)?;
                Ok(match name {
                    "unsend" => Self::Unsend { message_id: id },
                    "unreact" => Self::Unreact { message_id: id },
                    "sticker" => Self::Sticker { sticker_id: id },
                    _ => Self::Read { message_id: id },
                })
            }
            "leave" if args.is_empty() => Ok(Self::Leave),
            "leave" => Err(CommandError::Usage("/leave")),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Extracts `@username` tokens from message text, deduplicated in order.
pub fn mention_tokens(text: &str) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for word in text.split_whitespace() {
        let Some(name) = word.strip_prefix('@') else {
            continue;
        };
        let name = name.trim_end_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'));
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        let cmd: ClientCommand = "  hello there ".parse().unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Say {
                text: "hello there".into()
            }
        );
    }

    #[test]
    fn reply_keeps_the_whole_tail() {
        let id = Uuid::new_v4();
        let cmd: ClientCommand = format!("/reply {id} sounds   good").parse().unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Reply {
                reply_to: id,
                text: "sounds   good".into()
            }
        );
    }

    #[test]
    fn react_and_leave() {
        let id = Uuid::new_v4();
        assert_eq!(
            format!("/react {id} 👍").parse::<ClientCommand>().unwrap(),
            ClientCommand::React {
                message_id: id,
                emoji: "👍".into()
            }
        );
        assert_eq!(
            format!("/unreact {id}").parse::<ClientCommand>().unwrap(),
            ClientCommand::Unreact { message_id: id }
        );
        assert_eq!("/leave".parse::<ClientCommand>().unwrap(), ClientCommand::Leave);
    }

    #[test]
    fn protocol_errors() {
        assert_eq!("   ".parse::<ClientCommand>(), Err(CommandError::Empty));
        assert_eq!(
            "/dance".parse::<ClientCommand>(),
            Err(CommandError::Unknown("dance".into()))
        );
        assert!(matches!(
            "/reply not-a-uuid hi".parse::<ClientCommand>(),
            Err(CommandError::InvalidId(_))
        ));
        assert!(matches!(
            "/react".parse::<ClientCommand>(),
            Err(CommandError::Usage(_))
        ));
        assert_eq!(
            "/unreact".parse::<ClientCommand>(),
            Err(CommandError::Usage("/unreact <messageId>"))
        );
        assert!(matches!(
            "/leave now".parse::<ClientCommand>(),
            Err(CommandError::Usage(_))
        ));
    }

    #[test]
    fn mentions_are_trimmed_and_unique() {
        assert_eq!(
            mention_tokens("hey @alice, @bob! and @alice again @"),
            vec!["alice", "bob"]
        );
    }
}
