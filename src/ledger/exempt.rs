use std::collections::HashSet;

/// Decides which accounts skip the daily top-up.
pub trait ExemptionPolicy: Send + Sync {
    fn is_exempt(&self, user_id: &str) -> bool;
}

impl<F> ExemptionPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_exempt(&self, user_id: &str) -> bool {
        self(user_id)
    }
}

/// Exempts a fixed list of user ids. The default exempts nobody.
#[derive(Clone, Debug, Default)]
pub struct ExemptUserSet {
    users: HashSet<String>,
}

impl ExemptUserSet {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: users
                .into_iter()
                .map(Into::into)
                .map(|user| user.trim().to_string())
                .filter(|user| !user.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl ExemptionPolicy for ExemptUserSet {
    fn is_exempt(&self, user_id: &str) -> bool {
        self.users.contains(user_id)
    }
}
