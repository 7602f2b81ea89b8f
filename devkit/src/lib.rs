/*!
# Mesh DevKit - Stubs et utilitaires de test

Bibliothèque facilitant les tests du coordinateur et des agents :
- Services HTTP factices avec un `/health` pilotable
- Constructeurs de payloads de handshake
*/

pub mod payloads;
pub mod stub_service;

pub use payloads::HandshakeBuilder;
pub use stub_service::StubService;

/// Active les logs pendant les tests (RUST_LOG), sans erreur si déjà fait.
pub fn init_test_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}
