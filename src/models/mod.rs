mod account;
mod amount;
mod transaction;

pub use account::Account;
pub use amount::{json_minor_units, parse_minor_units, AmountError};
pub use transaction::{
    is_preliminary_payee, strip_preliminary_marker, ImportedIdBuilder, Transaction,
    DEFAULT_PRELIMINARY_MARKER,
};
