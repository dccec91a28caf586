use crate::error::RxError;

/// A notification delivered to a subscriber.
///
/// `Error` and `Complete` are terminal: at most one of them is ever
/// delivered, and nothing follows it.
#[derive(Debug, Clone)]
pub enum Event<A> {
    Next(A),
    Error(RxError),
    Complete,
}

impl<A> Event<A> {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Event::Next(_))
    }

    #[inline]
    pub fn value(&self) -> Option<&A> {
        match self {
            Event::Next(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn into_value(self) -> Option<A> {
        match self {
            Event::Next(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn error(&self) -> Option<&RxError> {
        match self {
            Event::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Event<B> {
        match self {
            Event::Next(v) => Event::Next(f(v)),
            Event::Error(e) => Event::Error(e),
            Event::Complete => Event::Complete,
        }
    }
}
