/*!
Payloads de handshake pour les tests

Construit le corps JSON de `POST /handshake` champ par champ ; `without`
retire un champ pour tester la validation.
*/

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone)]
pub struct HandshakeBuilder {
    fields: Map<String, Value>,
}

impl HandshakeBuilder {
    /// Handshake minimal valide : node_id, timestamp (maintenant), status "active".
    pub fn new(node_id: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("node_id".into(), json!(node_id));
        fields.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        fields.insert("status".into(), json!("active"));
        Self { fields }
    }

    pub fn timestamp(self, at: DateTime<Utc>) -> Self {
        self.field("timestamp", json!(at.to_rfc3339()))
    }

    pub fn status(self, status: &str) -> Self {
        self.field("status", json!(status))
    }

    pub fn ip(self, ip: &str) -> Self {
        self.field("ip", json!(ip))
    }

    pub fn vpn_ip(self, ip: &str) -> Self {
        self.field("vpn_ip", json!(ip))
    }

    pub fn role(self, role: &str) -> Self {
        self.field("role", json!(role))
    }

    pub fn capabilities(self, caps: &[&str]) -> Self {
        self.field("capabilities", json!(caps))
    }

    pub fn mac(self, mac: &str) -> Self {
        self.field("mac", json!(mac))
    }

    pub fn management_address(self, addr: &str) -> Self {
        self.field("management_address", json!(addr))
    }

    pub fn ssh_user(self, user: &str) -> Self {
        self.field("ssh_user", json!(user))
    }

    /// Champ arbitraire (écrase la valeur existante).
    pub fn field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        self.fields.remove(name);
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        serde_json::to_vec(&self.fields).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_handshake_has_required_fields() {
        let v = HandshakeBuilder::new("pi-node").build();
        assert_eq!(v["node_id"], "pi-node");
        assert_eq!(v["status"], "active");
        assert!(DateTime::parse_from_rfc3339(v["timestamp"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_without_removes_field() {
        let v = HandshakeBuilder::new("pi-node").ip("192.168.1.20").without("status").build();
        assert!(v.get("status").is_none());
        assert_eq!(v["ip"], "192.168.1.20");
    }
}
