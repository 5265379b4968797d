//! Domain layer shared by storage and the HTTP application.
//!
//! Holds the customer record, the wire-level request bodies and the pure
//! validation that turns requests into normalized values.
pub mod types;
pub mod validation;

pub use types::{
    CreateCustomerRequest, Customer, CustomerChanges, Gender, NewCustomer, UpdateCustomerRequest,
};
pub use validation::{validate_create, validate_update, ValidationError};
