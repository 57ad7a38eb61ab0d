//! Storage contracts.
//!
//! A contract binds a shard hash to a farmer for a time window with payment
//! terms and an audit budget. Both parties sign the canonical form: the
//! contract JSON with signature fields stripped and keys in lexicographic
//! order: so either side can later prove the other agreed to every term.

use std::fmt;

use serde::{Deserialize, Serialize};
use storj_core::{hash160, recover_compact, sha256, ContractId, NodeId, ShardHash, Timestamp};

use crate::ProtoError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// The two contract parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The party paying for storage.
    Renter,
    /// The party providing storage.
    Farmer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Renter => write!(f, "renter"),
            Role::Farmer => write!(f, "farmer"),
        }
    }
}

/// Signing progress of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractState {
    /// No signatures yet.
    Init,
    /// Exactly one party has signed.
    PartiallySigned,
    /// Both parties have signed; the contract is immutable.
    Complete,
}

/// A bilaterally signed storage agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    renter_id: NodeId,
    renter_hd_key: Option<String>,
    farmer_id: Option<NodeId>,
    data_size: u64,
    data_hash: ShardHash,
    store_begin: Timestamp,
    store_end: Timestamp,
    audit_count: u32,
    payment_destination: String,
    payment_amount: u64,
    renter_signature: Option<String>,
    farmer_signature: Option<String>,
}

impl Contract {
    /// Starts building a contract.
    pub fn builder() -> ContractBuilder {
        ContractBuilder::default()
    }

    /// Returns the renter's node identity.
    pub fn renter_id(&self) -> &NodeId {
        &self.renter_id
    }

    /// Returns the farmer's node identity, once filled on accept.
    pub fn farmer_id(&self) -> Option<&NodeId> {
        self.farmer_id.as_ref()
    }

    /// Returns the renter's hierarchical-deterministic key, if published.
    pub fn renter_hd_key(&self) -> Option<&str> {
        self.renter_hd_key.as_deref()
    }

    /// Returns the shard's content address.
    pub fn data_hash(&self) -> &ShardHash {
        &self.data_hash
    }

    /// Returns the shard size in bytes.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Returns the start of the storage window.
    pub fn store_begin(&self) -> Timestamp {
        self.store_begin
    }

    /// Returns the end of the storage window.
    pub fn store_end(&self) -> Timestamp {
        self.store_end
    }

    /// Returns the number of audit challenges provisioned.
    pub fn audit_count(&self) -> u32 {
        self.audit_count
    }

    /// Returns the payment destination address.
    pub fn payment_destination(&self) -> &str {
        &self.payment_destination
    }

    /// Returns the payment amount.
    pub fn payment_amount(&self) -> u64 {
        self.payment_amount
    }

    /// Returns true once the storage window has passed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.store_end.is_before(&now)
    }

    /// Returns the signing state.
    pub fn state(&self) -> ContractState {
        match (&self.renter_signature, &self.farmer_signature) {
            (None, None) => ContractState::Init,
            (Some(_), Some(_)) => ContractState::Complete,
            _ => ContractState::PartiallySigned,
        }
    }

    /// Fills the farmer identity when accepting a published contract.
    ///
    /// Rejected once any signature is present: the signed form is frozen.
    pub fn set_farmer_id(&mut self, farmer_id: NodeId) -> Result<(), ProtoError> {
        self.ensure_unsigned()?;
        self.farmer_id = Some(farmer_id);
        Ok(())
    }

    /// Fills the payment destination when accepting a published contract.
    pub fn set_payment_destination(&mut self, destination: String) -> Result<(), ProtoError> {
        self.ensure_unsigned()?;
        self.payment_destination = destination;
        Ok(())
    }

    fn ensure_unsigned(&self) -> Result<(), ProtoError> {
        if self.renter_signature.is_some() || self.farmer_signature.is_some() {
            return Err(ProtoError::ContractFrozen);
        }
        Ok(())
    }

    /// Returns the canonical form: signature fields stripped, keys in
    /// lexicographic order, UTF-8 JSON.
    pub fn canonical_json(&self) -> Result<String, ProtoError> {
        let mut value = serde_json::to_value(self)?;
        let map = value
            .as_object_mut()
            .expect("contract serializes to an object");
        map.remove("renter_signature");
        map.remove("farmer_signature");
        Ok(value.to_string())
    }

    fn signing_digest(&self) -> Result<[u8; 32], ProtoError> {
        Ok(sha256(self.canonical_json()?.as_bytes()))
    }

    /// Returns the contract's identity: hash160 of the canonical form.
    ///
    /// Signatures sit outside the canonical form, so signing never moves
    /// the id; filling accept-time fields (farmer id, payment destination)
    /// does. Pending publications therefore key on the stable shard hash,
    /// while tokens and records carry this id for the finished agreement.
    pub fn contract_id(&self) -> Result<ContractId, ProtoError> {
        Ok(ContractId::new(hash160(self.canonical_json()?.as_bytes())))
    }

    /// Signs the canonical form for the given role.
    ///
    /// Each role signs at most once; the signature is the base64 of the
    /// 65-byte compact recoverable ECDSA form.
    pub fn sign(&mut self, keypair: &storj_core::KeyPair, role: Role) -> Result<(), ProtoError> {
        let slot = match role {
            Role::Renter => &self.renter_signature,
            Role::Farmer => &self.farmer_signature,
        };
        if slot.is_some() {
            return Err(ProtoError::AlreadySigned(role));
        }

        let digest = self.signing_digest()?;
        let signature = BASE64.encode(keypair.sign(&digest));

        match role {
            Role::Renter => self.renter_signature = Some(signature),
            Role::Farmer => self.farmer_signature = Some(signature),
        }
        Ok(())
    }

    /// Verifies the role's signature recovers to the expected node identity.
    pub fn verify(&self, role: Role, expected: &NodeId) -> Result<(), ProtoError> {
        let recovered = self.recover_signer(role)?;
        if recovered != *expected {
            return Err(ProtoError::SignatureInvalid(role));
        }
        Ok(())
    }

    /// Recovers the node identity that produced the role's signature.
    pub fn recover_signer(&self, role: Role) -> Result<NodeId, ProtoError> {
        let signature = match role {
            Role::Renter => self.renter_signature.as_deref(),
            Role::Farmer => self.farmer_signature.as_deref(),
        }
        .ok_or(ProtoError::SignatureMissing(role))?;

        let bytes = BASE64
            .decode(signature)
            .map_err(|_| ProtoError::SignatureEncoding)?;
        let digest = self.signing_digest()?;
        let public = recover_compact(&digest, &bytes)?;
        Ok(NodeId::from_public_key(&public.serialize()))
    }

    /// Returns true when both signatures are present and verify.
    ///
    /// The renter signature must match `renter_id`; the farmer signature
    /// must match `farmer_id` when that field is filled, and must at least
    /// recover to a valid identity otherwise.
    pub fn is_complete(&self) -> bool {
        if self.verify(Role::Renter, &self.renter_id).is_err() {
            return false;
        }
        match &self.farmer_id {
            Some(farmer_id) => self.verify(Role::Farmer, farmer_id).is_ok(),
            None => self.recover_signer(Role::Farmer).is_ok(),
        }
    }
}

/// Builder validating required fields before a [`Contract`] exists.
#[derive(Debug, Default, Clone)]
pub struct ContractBuilder {
    renter_id: Option<NodeId>,
    renter_hd_key: Option<String>,
    farmer_id: Option<NodeId>,
    data_size: Option<u64>,
    data_hash: Option<ShardHash>,
    store_begin: Option<Timestamp>,
    store_end: Option<Timestamp>,
    audit_count: u32,
    payment_destination: String,
    payment_amount: u64,
}

impl ContractBuilder {
    /// Sets the renter identity (required).
    pub fn renter_id(mut self, id: NodeId) -> Self {
        self.renter_id = Some(id);
        self
    }

    /// Sets the renter's HD key.
    pub fn renter_hd_key(mut self, key: impl Into<String>) -> Self {
        self.renter_hd_key = Some(key.into());
        self
    }

    /// Sets the farmer identity.
    pub fn farmer_id(mut self, id: NodeId) -> Self {
        self.farmer_id = Some(id);
        self
    }

    /// Sets the shard size in bytes (required, positive).
    pub fn data_size(mut self, size: u64) -> Self {
        self.data_size = Some(size);
        self
    }

    /// Sets the shard content address (required).
    pub fn data_hash(mut self, hash: ShardHash) -> Self {
        self.data_hash = Some(hash);
        self
    }

    /// Sets the storage window start (required).
    pub fn store_begin(mut self, ts: Timestamp) -> Self {
        self.store_begin = Some(ts);
        self
    }

    /// Sets the storage window end (required, after the start).
    pub fn store_end(mut self, ts: Timestamp) -> Self {
        self.store_end = Some(ts);
        self
    }

    /// Sets the audit challenge budget.
    pub fn audit_count(mut self, count: u32) -> Self {
        self.audit_count = count;
        self
    }

    /// Sets the payment destination.
    pub fn payment_destination(mut self, destination: impl Into<String>) -> Self {
        self.payment_destination = destination.into();
        self
    }

    /// Sets the payment amount.
    pub fn payment_amount(mut self, amount: u64) -> Self {
        self.payment_amount = amount;
        self
    }

    /// Validates and produces an unsigned contract.
    pub fn build(self) -> Result<Contract, ProtoError> {
        let renter_id = self.renter_id.ok_or(ProtoError::MissingField("renter_id"))?;
        let data_hash = self.data_hash.ok_or(ProtoError::MissingField("data_hash"))?;
        let data_size = self.data_size.ok_or(ProtoError::MissingField("data_size"))?;
        let store_begin = self
            .store_begin
            .ok_or(ProtoError::MissingField("store_begin"))?;
        let store_end = self.store_end.ok_or(ProtoError::MissingField("store_end"))?;

        if data_size == 0 {
            return Err(ProtoError::InvalidDataSize);
        }
        if !store_end.is_after(&store_begin) {
            return Err(ProtoError::InvalidTimeRange);
        }

        Ok(Contract {
            renter_id,
            renter_hd_key: self.renter_hd_key,
            farmer_id: self.farmer_id,
            data_size,
            data_hash,
            store_begin,
            store_end,
            audit_count: self.audit_count,
            payment_destination: self.payment_destination,
            payment_amount: self.payment_amount,
            renter_signature: None,
            farmer_signature: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storj_core::{hash160, KeyPair};

    fn base_contract(renter: &KeyPair) -> Contract {
        Contract::builder()
            .renter_id(*renter.node_id())
            .data_size(11)
            .data_hash(ShardHash::of(b"hello storj"))
            .store_begin(Timestamp::new(0))
            .store_end(Timestamp::new(10_000))
            .audit_count(12)
            .build()
            .unwrap()
    }

    #[test]
    fn test_missing_fields_rejected() {
        let err = Contract::builder().build().unwrap_err();
        assert!(matches!(err, ProtoError::MissingField("renter_id")));
    }

    #[test]
    fn test_invalid_time_range_rejected() {
        let renter = KeyPair::generate();
        let err = Contract::builder()
            .renter_id(*renter.node_id())
            .data_size(1)
            .data_hash(ShardHash::of(b"x"))
            .store_begin(Timestamp::new(10))
            .store_end(Timestamp::new(10))
            .build()
            .unwrap_err();
        assert!(matches!(err, ProtoError::InvalidTimeRange));
    }

    #[test]
    fn test_zero_data_size_rejected() {
        let renter = KeyPair::generate();
        let err = Contract::builder()
            .renter_id(*renter.node_id())
            .data_size(0)
            .data_hash(ShardHash::of(b"x"))
            .store_begin(Timestamp::new(0))
            .store_end(Timestamp::new(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ProtoError::InvalidDataSize));
    }

    #[test]
    fn test_canonical_form_is_sorted_and_unsigned() {
        let renter = KeyPair::generate();
        let mut contract = base_contract(&renter);
        contract.sign(&renter, Role::Renter).unwrap();

        let canonical = contract.canonical_json().unwrap();
        assert!(!canonical.contains("renter_signature"));
        assert!(!canonical.contains("farmer_signature"));

        // Keys arrive lexicographically ordered.
        let audit = canonical.find("\"audit_count\"").unwrap();
        let hash = canonical.find("\"data_hash\"").unwrap();
        let size = canonical.find("\"data_size\"").unwrap();
        assert!(audit < hash && hash < size);
    }

    #[test]
    fn test_sign_and_verify() {
        let renter = KeyPair::generate();
        let other = KeyPair::generate();
        let mut contract = base_contract(&renter);

        contract.sign(&renter, Role::Renter).unwrap();
        assert!(contract.verify(Role::Renter, renter.node_id()).is_ok());
        assert!(matches!(
            contract.verify(Role::Renter, other.node_id()),
            Err(ProtoError::SignatureInvalid(Role::Renter))
        ));
    }

    #[test]
    fn test_countersign_completes() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let mut contract = base_contract(&renter);

        assert_eq!(contract.state(), ContractState::Init);
        contract.sign(&renter, Role::Renter).unwrap();
        assert_eq!(contract.state(), ContractState::PartiallySigned);
        assert!(!contract.is_complete());

        contract.sign(&farmer, Role::Farmer).unwrap();
        assert_eq!(contract.state(), ContractState::Complete);
        assert!(contract.is_complete());
    }

    #[test]
    fn test_double_sign_rejected() {
        let renter = KeyPair::generate();
        let mut contract = base_contract(&renter);
        contract.sign(&renter, Role::Renter).unwrap();
        assert!(matches!(
            contract.sign(&renter, Role::Renter),
            Err(ProtoError::AlreadySigned(Role::Renter))
        ));
    }

    #[test]
    fn test_mutation_after_signature_rejected() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let mut contract = base_contract(&renter);
        contract.sign(&renter, Role::Renter).unwrap();

        assert!(matches!(
            contract.set_farmer_id(*farmer.node_id()),
            Err(ProtoError::ContractFrozen)
        ));
    }

    #[test]
    fn test_farmer_accept_flow() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();

        // Renter publishes an unsigned contract; farmer fills its half,
        // signs, and the renter countersigns.
        let mut contract = base_contract(&renter);
        contract.set_farmer_id(*farmer.node_id()).unwrap();
        contract
            .set_payment_destination("payments-address".to_string())
            .unwrap();
        contract.sign(&farmer, Role::Farmer).unwrap();
        contract.sign(&renter, Role::Renter).unwrap();

        assert!(contract.is_complete());
        assert!(contract.verify(Role::Farmer, farmer.node_id()).is_ok());
        assert!(contract.verify(Role::Renter, renter.node_id()).is_ok());
    }

    #[test]
    fn test_wire_mutation_invalidates_signature() {
        let renter = KeyPair::generate();
        let mut contract = base_contract(&renter);
        contract.sign(&renter, Role::Renter).unwrap();

        // A tampered copy arriving over the wire must fail verification.
        let mut value = serde_json::to_value(&contract).unwrap();
        value["payment_amount"] = serde_json::json!(999_999);
        let tampered: Contract = serde_json::from_value(value).unwrap();

        assert!(tampered.verify(Role::Renter, renter.node_id()).is_err());
        assert!(!tampered.is_complete());
    }

    #[test]
    fn test_contract_id_tracks_canonical_form() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let mut contract = base_contract(&renter);
        let id = contract.contract_id().unwrap();

        // Accept-time fields move the id.
        contract.set_farmer_id(*farmer.node_id()).unwrap();
        let accepted = contract.contract_id().unwrap();
        assert_ne!(accepted, id);

        // Signatures sit outside the canonical form and do not.
        contract.sign(&farmer, Role::Farmer).unwrap();
        contract.sign(&renter, Role::Renter).unwrap();
        assert_eq!(contract.contract_id().unwrap(), accepted);

        // Different terms, different id.
        let other = Contract::builder()
            .renter_id(*renter.node_id())
            .data_size(11)
            .data_hash(ShardHash::of(b"hello storj"))
            .store_begin(Timestamp::new(0))
            .store_end(Timestamp::new(10_000))
            .audit_count(12)
            .payment_amount(999)
            .build()
            .unwrap();
        assert_ne!(other.contract_id().unwrap(), id);
    }

    #[test]
    fn test_data_hash_matches_hash160() {
        let contract = base_contract(&KeyPair::generate());
        assert_eq!(contract.data_hash().as_bytes(), &hash160(b"hello storj"));
    }

    #[test]
    fn test_expiry() {
        let contract = base_contract(&KeyPair::generate());
        assert!(!contract.is_expired(Timestamp::new(5_000)));
        assert!(contract.is_expired(Timestamp::new(10_001)));
    }
}
