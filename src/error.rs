// Error taxonomy for the client.
//
// Broker-reported errors arrive as Error frames carrying a text code; the
// well-known prefixes are classified into typed variants so callers can
// distinguish a misnamed topic from a transient fault.

pub type Result<T> = std::result::Result<T, Error>;

const BAD_TOPIC_PREFIX: &str = "E_BAD_TOPIC";
const BAD_MESSAGE_PREFIX: &str = "E_BAD_MESSAGE";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    #[error("connection closed")]
    Closed,
    #[error("bad topic: {0}")]
    BadTopic(String),
    #[error("bad message: {0}")]
    BadMessage(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("invalid frame: {0}")]
    Protocol(String),
    #[error("failed to encode command")]
    Encode(#[source] std::io::Error),
    #[error("failed to decode message body")]
    Decode(#[source] std::io::Error),
    #[error("lookup request failed")]
    Lookup(#[from] reqwest::Error),
    #[error("no server configured")]
    NoAddresses,
    #[error("could not acquire a connection to a server")]
    NoConnections,
    #[error("producer is not started")]
    NotStarted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    // Classify the text of a broker Error frame by its well-known prefixes.
    pub(crate) fn from_error_frame(text: &str) -> Self {
        if text.starts_with(BAD_TOPIC_PREFIX) {
            Error::BadTopic(text.to_string())
        } else if text.starts_with(BAD_MESSAGE_PREFIX) {
            Error::BadMessage(text.to_string())
        } else {
            Error::Broker(text.to_string())
        }
    }

    pub(crate) fn timeout(operation: &'static str) -> Self {
        Error::Timeout { operation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_bad_topic_prefix() {
        let err = Error::from_error_frame("E_BAD_TOPIC PUB topic name \"$\" is not valid");
        assert!(matches!(err, Error::BadTopic(_)));
    }

    #[test]
    fn classifies_bad_message_prefix() {
        let err = Error::from_error_frame("E_BAD_MESSAGE PUB message too big");
        assert!(matches!(err, Error::BadMessage(_)));
    }

    #[test]
    fn other_errors_surface_generically() {
        let err = Error::from_error_frame("E_INVALID cannot SUB in current state");
        assert!(matches!(err, Error::Broker(_)));
    }
}
