pub mod codec;
pub mod constants;

pub use codec::{encode_failure, encode_reply, parse_handshake};
pub use constants::{AddressType, Command, ReplyCode, SocksVersion};
