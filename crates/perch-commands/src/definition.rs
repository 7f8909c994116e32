//! Command definition model and its wire shape

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a definition is registered: globally or bound to one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    #[default]
    Global,
    Group(String),
}

impl Scope {
    /// The scope id the directory expects, `None` meaning global.
    pub fn id(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::Group(id) => Some(id),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Group(id) => write!(f, "group {id}"),
        }
    }
}

/// Kind of command, numbered as in the Discord application-command API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum CommandKind {
    #[default]
    ChatInput,
    User,
    Message,
}

impl From<CommandKind> for u8 {
    fn from(kind: CommandKind) -> u8 {
        match kind {
            CommandKind::ChatInput => 1,
            CommandKind::User => 2,
            CommandKind::Message => 3,
        }
    }
}

impl TryFrom<u8> for CommandKind {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(CommandKind::ChatInput),
            2 => Ok(CommandKind::User),
            3 => Ok(CommandKind::Message),
            other => Err(format!("unknown command kind {other}")),
        }
    }
}

/// Kind of a parameter/option, numbered as in the application-command API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum OptionKind {
    SubCommand,
    SubCommandGroup,
    Text,
    Integer,
    Boolean,
    User,
    Channel,
    Role,
}

impl From<OptionKind> for u8 {
    fn from(kind: OptionKind) -> u8 {
        match kind {
            OptionKind::SubCommand => 1,
            OptionKind::SubCommandGroup => 2,
            OptionKind::Text => 3,
            OptionKind::Integer => 4,
            OptionKind::Boolean => 5,
            OptionKind::User => 6,
            OptionKind::Channel => 7,
            OptionKind::Role => 8,
        }
    }
}

impl TryFrom<u8> for OptionKind {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(OptionKind::SubCommand),
            2 => Ok(OptionKind::SubCommandGroup),
            3 => Ok(OptionKind::Text),
            4 => Ok(OptionKind::Integer),
            5 => Ok(OptionKind::Boolean),
            6 => Ok(OptionKind::User),
            7 => Ok(OptionKind::Channel),
            8 => Ok(OptionKind::Role),
            other => Err(format!("unknown option kind {other}")),
        }
    }
}

/// A fixed choice offered for an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub name: String,
    pub value: Value,
}

impl Choice {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One parameter/option of a command. Options may nest, which is how
/// subcommands are expressed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: OptionKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionDefinition>,
}

impl OptionDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, kind: OptionKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            required: false,
            choices: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn choice(mut self, choice: Choice) -> Self {
        self.choices.push(choice);
        self
    }

    pub fn option(mut self, option: OptionDefinition) -> Self {
        self.options.push(option);
        self
    }
}

/// A locally declared command. Identity for reconciliation is (scope, name).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDefinition {
    pub name: String,
    pub description: String,
    pub kind: CommandKind,
    pub options: Vec<OptionDefinition>,
    pub scope: Scope,
}

impl CommandDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: CommandKind::ChatInput,
            options: Vec::new(),
            scope: Scope::Global,
        }
    }

    pub fn kind(mut self, kind: CommandKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn option(mut self, option: OptionDefinition) -> Self {
        self.options.push(option);
        self
    }

    /// Bind this definition to one group scope instead of global.
    pub fn for_group(mut self, group_id: impl Into<String>) -> Self {
        self.scope = Scope::Group(group_id.into());
        self
    }

    /// The JSON body the directory expects for create/patch.
    pub fn to_wire(&self) -> Value {
        let mut body = serde_json::json!({
            "name": self.name,
            "description": self.description,
            "type": u8::from(self.kind),
        });
        if !self.options.is_empty() {
            body["options"] = serde_json::to_value(&self.options)
                .expect("option definitions serialize infallibly");
        }
        body
    }
}

/// A definition as currently registered remotely, with its remote id.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCommandRecord {
    pub id: String,
    pub name: String,
}

impl RemoteCommandRecord {
    /// Extract the identity fields from a raw directory record. Records
    /// without id or name are protocol violations and yield `None`.
    pub fn from_wire(raw: &Value) -> Option<Self> {
        Some(Self {
            id: raw.get("id")?.as_str()?.to_string(),
            name: raw.get("name")?.as_str()?.to_string(),
        })
    }
}
