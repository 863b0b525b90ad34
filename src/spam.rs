use serde::Deserialize;

/// Terms whose presence in user content marks it as likely spam.
///
/// Administrators enter the terms as one comma separated string, e.g. `"hey, pokemon go hack"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "TermsRepr")]
pub struct SpamTriggerTerms(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum TermsRepr {
    Joined(String),
    List(Vec<String>),
}

impl From<TermsRepr> for SpamTriggerTerms {
    fn from(repr: TermsRepr) -> Self {
        match repr {
            TermsRepr::Joined(joined) => Self::parse(&joined),
            TermsRepr::List(terms) => Self::new(terms),
        }
    }
}

impl SpamTriggerTerms {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            terms
                .into_iter()
                .map(|term| term.as_ref().trim().to_lowercase())
                .filter(|term| !term.is_empty())
                .collect(),
        )
    }

    pub fn parse(joined: &str) -> Self {
        Self::new(joined.split(','))
    }

    pub fn terms(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Case-insensitive substring match against any term.
    pub fn matches(&self, text: &str) -> bool {
        if self.0.is_empty() {
            return false;
        }
        let text = text.to_lowercase();
        self.0.iter().any(|term| text.contains(term.as_str()))
    }
}
