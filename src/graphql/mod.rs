// # GraphQL Layer
//
// Runtime schema synthesis from a reflected catalog. The schema is built
// with async-graphql's dynamic API because the shape is only known after
// reflection; resolvers close over column metadata and delegate to the SQL
// builder, filter compiler and relationship loader.

pub mod scalars;
pub mod schema_builder;
pub mod selection;
pub mod type_mapper;

pub use schema_builder::{build_schema, GatewayState};
