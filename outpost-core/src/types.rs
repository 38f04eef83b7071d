//! Core identifiers and shared domain enums.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(value: &str) -> Option<Self> {
                Uuid::parse_str(value).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Identifies a tenant (a company) — the isolation boundary for all rows.
    TenantId
);
id_newtype!(
    /// Identifies a project (a workspace) within a tenant.
    ProjectId
);
id_newtype!(PostId);
id_newtype!(ChannelId);
id_newtype!(RuleId);
id_newtype!(RunId);
id_newtype!(ContentItemId);
id_newtype!(TemplateId);
id_newtype!(CampaignId);
id_newtype!(IncidentId);
id_newtype!(EventId);

/// Identifies a channel type / delivery platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Website,
    LinkedIn,
    Facebook,
    Instagram,
    TikTok,
    Threads,
    X,
    Pinterest,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 8] = [
        ChannelKind::Website,
        ChannelKind::LinkedIn,
        ChannelKind::Facebook,
        ChannelKind::Instagram,
        ChannelKind::TikTok,
        ChannelKind::Threads,
        ChannelKind::X,
        ChannelKind::Pinterest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Website => "website",
            Self::LinkedIn => "linkedin",
            Self::Facebook => "facebook",
            Self::Instagram => "instagram",
            Self::TikTok => "tiktok",
            Self::Threads => "threads",
            Self::X => "x",
            Self::Pinterest => "pinterest",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "website" => Some(Self::Website),
            "linkedin" => Some(Self::LinkedIn),
            "facebook" => Some(Self::Facebook),
            "instagram" => Some(Self::Instagram),
            "tiktok" => Some(Self::TikTok),
            "threads" => Some(Self::Threads),
            "x" => Some(Self::X),
            "pinterest" => Some(Self::Pinterest),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
