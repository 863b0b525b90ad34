use std::borrow::Cow;
use std::fmt::{Display, Formatter};

/// The named category of an operation being rate limited.
///
/// The set of kinds that are actually limited is decided by configuration, any other kind is
/// accepted and never limited.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionKind(Cow<'static, str>);

macro_rules! well_known_kinds {
    ($($name:ident => $value:literal),* $(,)?) => {
        impl ActionKind {
            $(pub const $name: ActionKind = ActionKind(Cow::Borrowed($value));)*

            /// Every kind the platform issues checks for.
            pub const WELL_KNOWN: &'static [ActionKind] = &[$(Self::$name),*];
        }
    };
}

well_known_kinds! {
    ARTICLE_UPDATE => "article_update",
    COMMENT_CREATION => "comment_creation",
    COMMENT_ANTISPAM_CREATION => "comment_antispam_creation",
    EMAIL_RECIPIENT => "email_recipient",
    FEEDBACK_MESSAGE_CREATION => "feedback_message_creation",
    FOLLOW_ACCOUNT => "follow_account",
    IMAGE_UPLOAD => "image_upload",
    LISTING_CREATION => "listing_creation",
    ORGANIZATION_CREATION => "organization_creation",
    PUBLISHED_ARTICLE_CREATION => "published_article_creation",
    PUBLISHED_ARTICLE_ANTISPAM_CREATION => "published_article_antispam_creation",
    REACTION_CREATION => "reaction_creation",
    SEND_EMAIL_CONFIRMATION => "send_email_confirmation",
    USER_SUBSCRIPTION_CREATION => "user_subscription_creation",
    USER_UPDATE => "user_update",
}

impl ActionKind {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_known(&self) -> bool {
        Self::WELL_KNOWN.contains(self)
    }
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for ActionKind {
    fn from(name: &'static str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ActionKind {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}
