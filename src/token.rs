/// Associates a readiness event with its suspended operation.
///
/// The value is the slot index of the operation's registration; the token
/// travels into the OS selector and comes back attached to the event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
