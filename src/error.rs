pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`], used by the node layer to decide
/// how a failure is reported. None of these are retried inside the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A mutation was sent to a replica.
    Permission,
    /// The request or the index configuration names something invalid.
    Configuration,
    /// The caller combined request options that cannot work together.
    CallerContract,
    /// The index, its storage or the document codec failed.
    Storage,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(#[from] tantivy::TantivyError),

    #[error("query parse error: {0}")]
    QueryParse(#[from] tantivy::query::QueryParserError),

    #[error("document codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Cannot {operation} from replica:  index <{index}> shard <{shard}>")]
    NotPrimary {
        operation: String,
        index: String,
        shard: u32,
    },

    #[error("Field <{field}> must have sortAs defined to be sortable")]
    NotSortable { field: String },

    #[error("Unknown similarity type <{0}>")]
    UnknownSimilarity(String),

    #[error("Invalid analyzer name <{0}>")]
    UnknownAnalyzer(String),

    #[error("{0} is not defined as a facetable field")]
    NotFacetable(String),

    #[error("Field <{0}> is not defined in the index")]
    UnknownField(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{feature} requires a full fetch of the document")]
    FullFetchRequired { feature: &'static str },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("shard <{shard}> for index <{index}> is closed")]
    Closed { index: String, shard: u32 },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotPrimary { .. } => ErrorKind::Permission,
            Error::NotSortable { .. }
            | Error::UnknownSimilarity(_)
            | Error::UnknownAnalyzer(_)
            | Error::NotFacetable(_)
            | Error::UnknownField(_)
            | Error::Config(_) => ErrorKind::Configuration,
            Error::FullFetchRequired { .. }
            | Error::InvalidRequest(_)
            | Error::QueryParse(_) => ErrorKind::CallerContract,
            Error::Io(_)
            | Error::Index(_)
            | Error::Codec(_)
            | Error::Closed { .. } => ErrorKind::Storage,
        }
    }
}
