use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Like(String),
    Delete(String),
    Direct(String),
    Group(String),
    Create { name: String, members: Vec<String> },
    Add { group: String, user: String },
    Remove { group: String, user: String },
    Promote { group: String, user: String },
    Exit(String),
    Who,
    Quit,
    Empty,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command: /{0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parses one input line. Anything not starting with `/` is a message.
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };
    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    let command = match (name, args.as_slice()) {
        ("like", [id]) => Command::Like(id.to_string()),
        ("like", _) => return Err(CommandError::Usage("/like <message-id>")),
        ("delete", [id]) => Command::Delete(id.to_string()),
        ("delete", _) => return Err(CommandError::Usage("/delete <message-id>")),
        ("dm", [user]) => Command::Direct(user.to_string()),
        ("dm", _) => return Err(CommandError::Usage("/dm <user>")),
        ("group", [group]) => Command::Group(group.to_string()),
        ("group", _) => return Err(CommandError::Usage("/group <group-id>")),
        ("create", [name, members @ ..]) if !members.is_empty() => Command::Create {
            name: name.to_string(),
            members: members.iter().map(|member| member.to_string()).collect(),
        },
        ("create", _) => return Err(CommandError::Usage("/create <name> <member>...")),
        ("add", [group, user]) => Command::Add {
            group: group.to_string(),
            user: user.to_string(),
        },
        ("add", _) => return Err(CommandError::Usage("/add <group-id> <user>")),
        ("remove", [group, user]) => Command::Remove {
            group: group.to_string(),
            user: user.to_string(),
        },
        ("remove", _) => return Err(CommandError::Usage("/remove <group-id> <user>")),
        ("promote", [group, user]) => Command::Promote {
            group: group.to_string(),
            user: user.to_string(),
        },
        ("promote", _) => return Err(CommandError::Usage("/promote <group-id> <user>")),
        ("exit", [group]) => Command::Exit(group.to_string()),
        ("exit", _) => return Err(CommandError::Usage("/exit <group-id>")),
        ("who", []) => Command::Who,
        ("quit", []) => Command::Quit,
        (other, _) => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(command)
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
