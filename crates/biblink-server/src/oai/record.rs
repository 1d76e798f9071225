/// One record or header reconstructed from an OAI page
///
/// `metadata` is `None` for deleted records and for `ListIdentifiers`
/// headers.
#[derive(Debug, Clone, PartialEq)]
pub struct OaiRecord<T> {
    pub identifier: String,
    pub datestamp: String,
    pub deleted: bool,
    pub metadata: Option<T>,
}

impl<T> Default for OaiRecord<T> {
    fn default() -> Self {
        Self {
            identifier: String::new(),
            datestamp: String::new(),
            deleted: false,
            metadata: None,
        }
    }
}
