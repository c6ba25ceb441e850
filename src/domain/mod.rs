//! Domain models for the broker.
//!
//! - Instance: a provisioned service plan and its lifecycle status
//! - Binding: credentials handed to a consumer of an instance
//! - Parameters: request parameters and the schemas that validate them

pub mod binding;
pub mod instance;
pub mod parameters;

pub use binding::{Binding, BindingStatus};
pub use instance::{merge_details, Instance, InstanceStatus};
pub use parameters::{
    ArrayPropertySchema, BooleanPropertySchema, FloatPropertySchema, InputParametersSchema,
    IntegerPropertySchema, ObjectPropertySchema, Parameters, PropertySchema,
    StringPropertySchema, ValidationError,
};
