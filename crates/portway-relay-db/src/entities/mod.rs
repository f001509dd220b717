//! Database entities

pub mod tunnel_registration;

pub use tunnel_registration::Entity as TunnelRegistration;

pub mod prelude {
    pub use super::tunnel_registration::Entity as TunnelRegistration;
}
