use std::fmt::{Display, Formatter};

/// The signed-in user a mutation queue belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key under which this user's local writes are stored. Empty for the
    /// unauthenticated user.
    pub fn to_key(&self) -> String {
        self.uid.clone().unwrap_or_default()
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{uid}"),
            None => write!(f, "<anonymous>"),
        }
    }
}
