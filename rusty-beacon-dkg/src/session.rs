//! The DKG session state machine.
//!
//! A session is pure state plus transition methods; it never does I/O. The
//! driver (or a test) calls `start_dealing` / `start_responding` /
//! `start_justifying` / `finalize` to advance phases, feeding packets in
//! through `receive` as they arrive. Packets for a later phase are buffered
//! and replayed on entry; packets for a passed phase are rejected.

use std::collections::{BTreeMap, BTreeSet};

use bls12_381::{G2Projective, Scalar};
use log::{debug, info, warn};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use rusty_beacon_crypto::{
    decode_scalar, ecies, poly, DleqProof, KeyPair, PrivatePoly, PublicPoly, Share,
};
use rusty_beacon_types::{
    dkg::{Deal, DealStatus, EncryptedShare, Justification, Response},
    DkgPacket, DkgPayload, DkgPhase, Group, GroupProposal, Hash, Identity, SessionId,
};

use crate::status::StatusMatrix;
use crate::DkgError;

/// Inputs a reshare session carries about the previous group.
#[derive(Clone)]
pub struct OldGroup {
    pub group: Group,
    pub public: PublicPoly,
    /// Our share of the old key, present iff we are a dealer.
    pub share: Option<Share>,
}

/// What a finished session hands back to the orchestrator.
pub struct DkgOutput {
    /// The new group, commitments filled in.
    pub group: Group,
    /// Our share of the new key; `None` for a dealer leaving the group.
    pub share: Option<Share>,
    /// Qualified dealer indices.
    pub qual: Vec<u32>,
}

/// Minimal persisted marker for an in-flight session.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub phase: DkgPhase,
}

enum Mode {
    Fresh,
    Reshare { old: OldGroup },
}

/// One dealer's deal as this node sees it.
struct ReceivedDeal {
    /// Decoded commitment polynomial; `None` if the commits were malformed
    /// (the dealer can never qualify then).
    public: Option<PublicPoly>,
    deal: Deal,
    /// The share dealt to us, once decrypted or justified.
    my_share: Option<Scalar>,
}

/// Pedersen joint-Feldman session, fresh or resharing.
pub struct DkgSession {
    session_id: SessionId,
    keypair: KeyPair,
    proposal: GroupProposal,
    mode: Mode,
    /// Dealer identities: the proposal's nodes for a fresh session, the
    /// old group's nodes for a reshare.
    dealers: Vec<Identity>,
    /// Dealer count needed for a usable result: `t_new` fresh, `t_old` reshare.
    dealer_threshold: usize,
    my_dealer_index: Option<u32>,
    my_holder_index: Option<u32>,
    phase: DkgPhase,
    secret_poly: Option<PrivatePoly>,
    deals: BTreeMap<u32, ReceivedDeal>,
    responses_from: BTreeSet<u32>,
    justified: BTreeSet<u32>,
    statuses: StatusMatrix,
    buffered: Vec<DkgPacket>,
    genesis_seed: Hash,
}

impl DkgSession {
    /// Fresh DKG: every proposal member deals and holds.
    pub fn fresh(
        keypair: KeyPair,
        proposal: GroupProposal,
        session_id: SessionId,
    ) -> Result<Self, DkgError> {
        proposal.validate()?;
        let pk = keypair.public_bytes();
        let my_index = proposal
            .nodes
            .iter()
            .position(|n| n.public_key == pk)
            .map(|p| p as u32 + 1);
        if my_index.is_none() {
            return Err(DkgError::NotAParticipant);
        }

        // the seed is fixed forever at the first DKG; derive it from the
        // session id everyone already agreed on
        let mut hasher = Sha256::new();
        hasher.update(b"rusty-beacon:genesis-seed");
        hasher.update(session_id);
        let genesis_seed: Hash = hasher.finalize().into();

        let dealers = proposal.nodes.clone();
        let threshold = proposal.threshold as usize;
        let holders = proposal.nodes.len() as u32;
        Ok(DkgSession {
            session_id,
            keypair,
            statuses: StatusMatrix::new(holders),
            dealers,
            dealer_threshold: threshold,
            my_dealer_index: my_index,
            my_holder_index: my_index,
            proposal,
            mode: Mode::Fresh,
            phase: DkgPhase::Accepting,
            secret_poly: None,
            deals: BTreeMap::new(),
            responses_from: BTreeSet::new(),
            justified: BTreeSet::new(),
            buffered: Vec::new(),
            genesis_seed,
        })
    }

    /// Reshare: the old group's members deal, the proposal's members hold.
    /// A node may be either, or both.
    pub fn reshare(
        keypair: KeyPair,
        old: OldGroup,
        proposal: GroupProposal,
        session_id: SessionId,
    ) -> Result<Self, DkgError> {
        proposal.validate()?;
        let pk = keypair.public_bytes();
        let my_dealer_index = old
            .group
            .nodes
            .iter()
            .position(|n| n.public_key == pk)
            .map(|p| p as u32 + 1);
        let my_holder_index = proposal
            .nodes
            .iter()
            .position(|n| n.public_key == pk)
            .map(|p| p as u32 + 1);
        if my_dealer_index.is_none() && my_holder_index.is_none() {
            return Err(DkgError::NotAParticipant);
        }
        if my_dealer_index.is_some() && old.share.is_none() {
            // a dealer without its old share cannot deal
            return Err(DkgError::NotAParticipant);
        }

        let dealers = old.group.nodes.clone();
        let dealer_threshold = old.group.threshold as usize;
        let genesis_seed = old.group.genesis_seed;
        let holders = proposal.nodes.len() as u32;
        Ok(DkgSession {
            session_id,
            keypair,
            statuses: StatusMatrix::new(holders),
            dealers,
            dealer_threshold,
            my_dealer_index,
            my_holder_index,
            proposal,
            mode: Mode::Reshare { old },
            phase: DkgPhase::Accepting,
            secret_poly: None,
            deals: BTreeMap::new(),
            responses_from: BTreeSet::new(),
            justified: BTreeSet::new(),
            buffered: Vec::new(),
            genesis_seed,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn phase(&self) -> DkgPhase {
        self.phase
    }

    pub fn snapshot(&self) -> Result<Vec<u8>, DkgError> {
        Ok(bincode::serialize(&SessionSnapshot {
            session_id: self.session_id,
            phase: self.phase,
        })?)
    }

    fn holders(&self) -> &[Identity] {
        &self.proposal.nodes
    }

    /// Enter the dealing phase. Returns our signed deal packet if this
    /// node is a dealer.
    pub fn start_dealing<R: RngCore>(&mut self, rng: &mut R) -> Result<Option<DkgPacket>, DkgError> {
        self.phase = DkgPhase::Dealing;
        self.drain_buffer()?;
        let dealer_index = match self.my_dealer_index {
            Some(i) => i,
            None => return Ok(None),
        };

        let degree = self.proposal.threshold as usize - 1;
        let secret_poly = match &self.mode {
            Mode::Fresh => PrivatePoly::random(degree, rng),
            Mode::Reshare { old } => {
                // the constant term is our current share, so the dealt
                // polynomials interpolate back to the same group secret
                let share = old.share.as_ref().ok_or(DkgError::NotAParticipant)?;
                PrivatePoly::with_constant(share.private, degree, rng)
            }
        };
        let public = secret_poly.commit();

        let mut shares = Vec::new();
        let mut my_share = None;
        for (pos, holder) in self.holders().iter().enumerate() {
            let recipient_index = pos as u32 + 1;
            let value = secret_poly.eval(recipient_index);
            if Some(recipient_index) == self.my_holder_index {
                my_share = Some(value);
                continue;
            }
            let recipient_pk = rusty_beacon_crypto::decode_g2(&holder.public_key)?;
            let (ephemeral, ciphertext) = ecies::encrypt(&recipient_pk, &value, rng);
            shares.push(EncryptedShare {
                recipient_index,
                ephemeral,
                ciphertext,
            });
        }

        let deal = Deal {
            commits: public.to_bytes(),
            shares,
        };
        // our own deal is trusted as-is
        self.deals.insert(
            dealer_index,
            ReceivedDeal {
                public: Some(public),
                deal: deal.clone(),
                my_share,
            },
        );
        self.secret_poly = Some(secret_poly);

        debug!("session {}: dealt to {} holders", self.session_id, self.holders().len());
        self.sign_packet(dealer_index, DkgPayload::Deal(deal)).map(Some)
    }

    /// Whether every dealer's deal has arrived.
    pub fn deals_complete(&self) -> bool {
        self.deals.len() == self.dealers.len()
    }

    /// Enter the responding phase: verify every received deal and emit our
    /// statuses. Returns `None` if this node holds no share in the new group.
    pub fn start_responding<R: RngCore>(
        &mut self,
        rng: &mut R,
    ) -> Result<Option<DkgPacket>, DkgError> {
        self.phase = DkgPhase::Responding;
        self.drain_buffer()?;

        let holder_index = match self.my_holder_index {
            Some(i) => i,
            None => return Ok(None),
        };

        let mut statuses = Vec::new();
        let dealer_indices: Vec<u32> = self.deals.keys().copied().collect();
        for dealer in dealer_indices {
            let verdict = self.verify_deal(dealer, holder_index, rng)?;
            match &verdict {
                DealStatus::Approve => {}
                DealStatus::Complaint { .. } => {
                    warn!(
                        "session {}: complaining about dealer {}",
                        self.session_id, dealer
                    );
                    self.statuses.set(dealer, holder_index, false);
                }
            }
            statuses.push((dealer, verdict));
        }

        self.responses_from.insert(holder_index);
        self.sign_packet(holder_index, DkgPayload::Response(Response { statuses }))
            .map(Some)
    }

    /// Check one deal from our point of view and produce our wire verdict.
    /// Publicly checkable failures poison the dealer for every holder;
    /// share-specific failures produce a witnessed complaint.
    fn verify_deal<R: RngCore>(
        &mut self,
        dealer: u32,
        holder_index: u32,
        rng: &mut R,
    ) -> Result<DealStatus, DkgError> {
        if Some(dealer) == self.my_dealer_index {
            return Ok(DealStatus::Approve);
        }
        let received = match self.deals.get(&dealer) {
            Some(r) => r,
            None => return Ok(DealStatus::Approve),
        };
        let public = match &received.public {
            Some(p) => p.clone(),
            None => {
                // malformed commits: everyone sees the same garbage
                self.poison_dealer(dealer);
                return Ok(DealStatus::Approve);
            }
        };

        // commitment polynomial must match the proposed threshold
        if public.threshold() != self.proposal.threshold as usize {
            self.poison_dealer(dealer);
            return Ok(DealStatus::Approve);
        }

        // reshare: the deal's constant term must commit to the dealer's
        // old share, P_old(dealer) in the exponent
        if let Mode::Reshare { old } = &self.mode {
            if *public.public_key() != old.public.eval(dealer) {
                warn!(
                    "session {}: dealer {} deal does not extend the old key",
                    self.session_id, dealer
                );
                self.poison_dealer(dealer);
                return Ok(DealStatus::Approve);
            }
        }

        let entry = received
            .deal
            .shares
            .iter()
            .find(|s| s.recipient_index == holder_index)
            .cloned();
        let entry = match entry {
            Some(e) => e,
            None => {
                // no share for us at all: complain without a witness;
                // verifiers check deal contents themselves
                return Ok(DealStatus::Complaint {
                    witness: Vec::new(),
                    dleq_challenge: Vec::new(),
                    dleq_response: Vec::new(),
                });
            }
        };

        let ephemeral = match rusty_beacon_crypto::decode_g2(&entry.ephemeral) {
            Ok(p) => p,
            Err(_) => return self.witnessed_complaint(&entry, rng),
        };
        let shared = ephemeral * self.keypair.secret();
        let value = match ecies::decrypt_with_point(&shared, &entry.ciphertext) {
            Ok(v) => v,
            Err(_) => return self.witnessed_complaint(&entry, rng),
        };
        if G2Projective::generator() * value != public.eval(holder_index) {
            return self.witnessed_complaint(&entry, rng);
        }

        if let Some(r) = self.deals.get_mut(&dealer) {
            r.my_share = Some(value);
        }
        Ok(DealStatus::Approve)
    }

    /// Build a complaint carrying the ECDH point and a DLEQ proof that it
    /// was derived with our long-term key.
    fn witnessed_complaint<R: RngCore>(
        &mut self,
        entry: &EncryptedShare,
        rng: &mut R,
    ) -> Result<DealStatus, DkgError> {
        let ephemeral = match rusty_beacon_crypto::decode_g2(&entry.ephemeral) {
            Ok(p) => p,
            Err(_) => {
                // nothing to prove against; the bad encoding is public
                return Ok(DealStatus::Complaint {
                    witness: Vec::new(),
                    dleq_challenge: Vec::new(),
                    dleq_response: Vec::new(),
                });
            }
        };
        let (_, witness, proof) = DleqProof::prove(
            &G2Projective::generator(),
            &ephemeral,
            self.keypair.secret(),
            rng,
        );
        let (dleq_challenge, dleq_response) = proof.to_bytes();
        Ok(DealStatus::Complaint {
            witness: rusty_beacon_crypto::encode_g2(&witness),
            dleq_challenge,
            dleq_response,
        })
    }

    fn poison_dealer(&mut self, dealer: u32) {
        for holder in 1..=self.statuses.holders() {
            self.statuses.set(dealer, holder, false);
        }
    }

    /// Whether every share holder's response has arrived.
    pub fn responses_complete(&self) -> bool {
        self.responses_from.len() == self.holders().len()
    }

    /// Enter the justification phase. Returns our justification packet if
    /// we are a dealer someone complained about.
    pub fn start_justifying(&mut self) -> Result<Option<DkgPacket>, DkgError> {
        self.phase = DkgPhase::Justifying;
        self.drain_buffer()?;

        let dealer_index = match self.my_dealer_index {
            Some(i) => i,
            None => return Ok(None),
        };
        let complainers = self.statuses.complaints_against(dealer_index);
        if complainers.is_empty() {
            return Ok(None);
        }
        let secret_poly = match &self.secret_poly {
            Some(p) => p,
            None => return Ok(None),
        };

        info!(
            "session {}: justifying against {} complaints",
            self.session_id,
            complainers.len()
        );
        let shares = complainers
            .into_iter()
            .map(|holder| (holder, secret_poly.eval(holder).to_bytes().to_vec()))
            .collect();
        self.justified.insert(dealer_index);
        self.sign_packet(dealer_index, DkgPayload::Justification(Justification { shares }))
            .map(Some)
    }

    /// Whether any complaint is still waiting for a justification from a
    /// dealer that could conceivably send one.
    pub fn justifications_pending(&self) -> bool {
        self.deals.keys().any(|&dealer| {
            !self.justified.contains(&dealer) && !self.statuses.dealer_clear(dealer)
        })
    }

    pub fn has_complaints(&self) -> bool {
        self.statuses.has_complaints()
    }

    /// Feed an incoming packet. Wrong-session and passed-phase packets
    /// error out (the driver drops them); future-phase packets are
    /// buffered.
    pub fn receive(&mut self, packet: DkgPacket) -> Result<(), DkgError> {
        if packet.session_id != self.session_id {
            return Err(DkgError::WrongSession);
        }
        let phase = packet.payload.phase();
        if self.phase > phase || self.phase == DkgPhase::Finished {
            return Err(DkgError::OutOfPhase { current: self.phase });
        }
        self.verify_packet(&packet)?;
        if phase > self.phase {
            self.buffered.push(packet);
            return Ok(());
        }
        self.apply(packet)
    }

    fn drain_buffer(&mut self) -> Result<(), DkgError> {
        let ready: Vec<DkgPacket> = {
            let phase = self.phase;
            let (ready, rest) = std::mem::take(&mut self.buffered)
                .into_iter()
                .partition(|p| p.payload.phase() <= phase);
            self.buffered = rest;
            ready
        };
        for packet in ready {
            self.apply(packet)?;
        }
        Ok(())
    }

    fn verify_packet(&self, packet: &DkgPacket) -> Result<(), DkgError> {
        if packet.sender_index == 0 {
            return Err(DkgError::UnknownSender(0));
        }
        let sender = match packet.payload {
            DkgPayload::Deal(_) | DkgPayload::Justification(_) => {
                self.dealers.get(packet.sender_index as usize - 1)
            }
            DkgPayload::Response(_) => self.holders().get(packet.sender_index as usize - 1),
        };
        let sender = match sender {
            Some(s) => s,
            None => return Err(DkgError::UnknownSender(packet.sender_index)),
        };
        let digest =
            DkgPacket::signing_digest(&packet.session_id, packet.sender_index, &packet.payload)?;
        KeyPair::verify(&sender.public_key, &digest, &packet.signature)
            .map_err(|_| DkgError::BadPacketSignature(packet.sender_index))
    }

    fn apply(&mut self, packet: DkgPacket) -> Result<(), DkgError> {
        match packet.payload {
            DkgPayload::Deal(deal) => self.apply_deal(packet.sender_index, deal),
            DkgPayload::Response(response) => self.apply_response(packet.sender_index, response),
            DkgPayload::Justification(j) => self.apply_justification(packet.sender_index, j),
        }
    }

    fn apply_deal(&mut self, dealer: u32, deal: Deal) -> Result<(), DkgError> {
        if self.deals.contains_key(&dealer) {
            debug!("session {}: duplicate deal from {}", self.session_id, dealer);
            return Ok(());
        }
        let public = PublicPoly::from_bytes(&deal.commits).ok();
        self.deals.insert(
            dealer,
            ReceivedDeal {
                public,
                deal,
                my_share: None,
            },
        );
        Ok(())
    }

    fn apply_response(&mut self, holder: u32, response: Response) -> Result<(), DkgError> {
        if !self.responses_from.insert(holder) {
            debug!("session {}: duplicate response from {}", self.session_id, holder);
            return Ok(());
        }
        for (dealer, status) in response.statuses {
            if dealer == 0 || dealer > self.dealers.len() as u32 {
                continue;
            }
            match status {
                DealStatus::Approve => {}
                DealStatus::Complaint {
                    witness,
                    dleq_challenge,
                    dleq_response,
                } => {
                    if self.complaint_stands(dealer, holder, &witness, &dleq_challenge, &dleq_response) {
                        self.statuses.set(dealer, holder, false);
                    } else {
                        debug!(
                            "session {}: dropping unverifiable complaint by {} against {}",
                            self.session_id, holder, dealer
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Adjudicate a third-party complaint. Returns true when the complaint
    /// is upheld.
    fn complaint_stands(
        &self,
        dealer: u32,
        holder: u32,
        witness: &[u8],
        dleq_challenge: &[u8],
        dleq_response: &[u8],
    ) -> bool {
        if holder == 0 || holder > self.holders().len() as u32 {
            return false;
        }
        let received = match self.deals.get(&dealer) {
            // we never saw the deal either; give the complainer the
            // benefit of the doubt
            None => return true,
            Some(r) => r,
        };
        let public = match &received.public {
            None => return true,
            Some(p) => p,
        };
        let entry = match received
            .deal
            .shares
            .iter()
            .find(|s| s.recipient_index == holder)
        {
            // the dealer demonstrably skipped this holder
            None => return witness.is_empty(),
            Some(e) => e,
        };

        // witnessed complaint: check the DLEQ, re-run the decryption and
        // confirm the mismatch
        let complainer_pk = match self
            .holders()
            .get(holder as usize - 1)
            .map(|h| rusty_beacon_crypto::decode_g2(&h.public_key))
        {
            Some(Ok(pk)) => pk,
            _ => return false,
        };
        let ephemeral = match rusty_beacon_crypto::decode_g2(&entry.ephemeral) {
            Ok(p) => p,
            // undecodable ephemeral is the dealer's fault
            Err(_) => return true,
        };
        let witness_point = match rusty_beacon_crypto::decode_g2(witness) {
            Ok(p) => p,
            Err(_) => return false,
        };
        let proof = match DleqProof::from_bytes(dleq_challenge, dleq_response) {
            Ok(p) => p,
            Err(_) => return false,
        };
        if proof
            .verify(
                &G2Projective::generator(),
                &ephemeral,
                &complainer_pk,
                &witness_point,
            )
            .is_err()
        {
            return false;
        }
        match ecies::decrypt_with_point(&witness_point, &entry.ciphertext) {
            Ok(value) => G2Projective::generator() * value != public.eval(holder),
            // ciphertext does not even decrypt to a scalar
            Err(_) => true,
        }
    }

    fn apply_justification(&mut self, dealer: u32, just: Justification) -> Result<(), DkgError> {
        if !self.justified.insert(dealer) {
            debug!(
                "session {}: duplicate justification from {}",
                self.session_id, dealer
            );
            return Ok(());
        }
        let public = match self.deals.get(&dealer).and_then(|r| r.public.clone()) {
            Some(p) => p,
            // no deal to justify against; dealer stays disqualified
            None => return Ok(()),
        };
        for (holder, share_bytes) in just.shares {
            if holder == 0 || holder > self.holders().len() as u32 {
                continue;
            }
            let value = match decode_scalar(&share_bytes) {
                Ok(v) => v,
                Err(_) => {
                    self.statuses.set(dealer, holder, false);
                    continue;
                }
            };
            if G2Projective::generator() * value == public.eval(holder) {
                self.statuses.set(dealer, holder, true);
                if Some(holder) == self.my_holder_index {
                    if let Some(r) = self.deals.get_mut(&dealer) {
                        r.my_share = Some(value);
                    }
                }
            } else {
                self.statuses.set(dealer, holder, false);
            }
        }
        Ok(())
    }

    /// Close the session and compute the result.
    pub fn finalize(mut self) -> Result<DkgOutput, DkgError> {
        self.phase = DkgPhase::Justifying;
        self.drain_buffer()?;
        self.phase = DkgPhase::Finished;

        let qual: Vec<u32> = self
            .deals
            .iter()
            .filter(|(_, r)| r.public.is_some())
            .map(|(&d, _)| d)
            .filter(|&d| self.statuses.dealer_clear(d))
            .collect();
        info!(
            "session {}: finalizing with qualified set {:?}",
            self.session_id, qual
        );
        if qual.len() < self.dealer_threshold {
            return Err(DkgError::NotEnoughDealers {
                have: qual.len(),
                need: self.dealer_threshold,
            });
        }

        match self.mode {
            Mode::Fresh => Self::finalize_fresh(
                qual,
                self.deals,
                self.my_holder_index,
                self.proposal,
                self.genesis_seed,
            ),
            Mode::Reshare { old } => Self::finalize_reshare(
                qual,
                self.deals,
                self.my_holder_index,
                self.proposal,
                old,
            ),
        }
    }

    /// Fresh DKG result: share and polynomial are sums over the qualified
    /// dealers; the key is whatever `P(0)` emerges.
    fn finalize_fresh(
        qual: Vec<u32>,
        deals: BTreeMap<u32, ReceivedDeal>,
        my_holder_index: Option<u32>,
        proposal: GroupProposal,
        genesis_seed: Hash,
    ) -> Result<DkgOutput, DkgError> {
        let mut public = PublicPoly::zero(proposal.threshold as usize);
        let mut secret = Scalar::zero();
        for &dealer in &qual {
            let received = deals.get(&dealer).ok_or(DkgError::MissingShare(dealer))?;
            let dealer_public = received.public.as_ref().ok_or(DkgError::MissingShare(dealer))?;
            public.add(dealer_public);
            if my_holder_index.is_some() {
                let value = received.my_share.ok_or(DkgError::MissingShare(dealer))?;
                secret += value;
            }
        }

        let share = match my_holder_index {
            None => None,
            Some(index) => {
                let share = Share {
                    index,
                    private: secret,
                    public: public.clone(),
                };
                share.validate()?;
                Some(share)
            }
        };

        let commits = public.to_bytes();
        let group = proposal.into_group(genesis_seed, commits);
        Ok(DkgOutput { group, share, qual })
    }

    /// Reshare result: the new share interpolates the dealt evaluations at
    /// zero over the old threshold; the polynomial is recovered coefficient
    /// by coefficient. The recovered key must equal the old one.
    fn finalize_reshare(
        qual: Vec<u32>,
        deals: BTreeMap<u32, ReceivedDeal>,
        my_holder_index: Option<u32>,
        proposal: GroupProposal,
        old: OldGroup,
    ) -> Result<DkgOutput, DkgError> {
        let t_old = old.group.threshold as usize;
        let t_new = proposal.threshold as usize;

        let mut coeff_shares: Vec<Vec<(u32, G2Projective)>> = vec![Vec::new(); t_new];
        let mut my_shares: Vec<(u32, Scalar)> = Vec::new();
        for &dealer in &qual {
            let received = deals.get(&dealer).ok_or(DkgError::MissingShare(dealer))?;
            let dealer_public = received.public.as_ref().ok_or(DkgError::MissingShare(dealer))?;
            for (k, shares) in coeff_shares.iter_mut().enumerate() {
                shares.push((dealer, *dealer_public.coeff(k)));
            }
            if my_holder_index.is_some() {
                let value = received.my_share.ok_or(DkgError::MissingShare(dealer))?;
                my_shares.push((dealer, value));
            }
        }

        let commits: Vec<G2Projective> = coeff_shares
            .iter()
            .map(|shares| poly::recover_g2_at_zero(t_old, shares))
            .collect::<Result<_, _>>()?;
        let public = PublicPoly::new(commits);

        // the invariant that makes a reshare a reshare
        if public.public_key() != old.public.public_key() {
            return Err(DkgError::ReshareInconsistent);
        }

        let share = match my_holder_index {
            None => None,
            Some(index) => {
                let private = poly::recover_scalar_at_zero(t_old, &my_shares)?;
                let share = Share {
                    index,
                    private,
                    public: public.clone(),
                };
                share.validate()?;
                Some(share)
            }
        };

        let commits = public.to_bytes();
        let group = proposal.into_group(old.group.genesis_seed, commits);
        Ok(DkgOutput { group, share, qual })
    }

    fn sign_packet(&self, sender_index: u32, payload: DkgPayload) -> Result<DkgPacket, DkgError> {
        let digest = DkgPacket::signing_digest(&self.session_id, sender_index, &payload)?;
        let signature = self.keypair.sign(&digest);
        Ok(DkgPacket {
            session_id: self.session_id,
            sender_index,
            payload,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rusty_beacon_crypto::tbls;
    use rusty_beacon_types::Scheme;

    fn make_proposal(keys: &[KeyPair], threshold: u32) -> GroupProposal {
        GroupProposal {
            nodes: keys
                .iter()
                .enumerate()
                .map(|(i, k)| k.identity(format!("127.0.0.1:{}", 9000 + i), false))
                .collect(),
            threshold,
            period: 2,
            genesis_time: 1_700_000_000,
            scheme: Scheme::Chained,
            transition_time: None,
        }
    }

    fn sign_as(keypair: &KeyPair, session_id: SessionId, sender: u32, payload: DkgPayload) -> DkgPacket {
        let digest = DkgPacket::signing_digest(&session_id, sender, &payload).unwrap();
        DkgPacket {
            session_id,
            sender_index: sender,
            payload,
            signature: keypair.sign(&digest),
        }
    }

    fn deliver(sessions: &mut [DkgSession], from: usize, packet: &DkgPacket) {
        for (i, session) in sessions.iter_mut().enumerate() {
            if i == from {
                continue;
            }
            // protocol drops are fine; hard errors are not
            if let Err(e) = session.receive(packet.clone()) {
                panic!("session {i} rejected packet from {from}: {e}");
            }
        }
    }

    /// Step every session through deal/respond/justify with full delivery,
    /// applying `tamper` to outgoing deal packets first.
    fn run_to_finalize<F>(sessions: &mut Vec<DkgSession>, tamper: F)
    where
        F: Fn(usize, DkgPacket) -> DkgPacket,
    {
        let mut rng = OsRng;
        let deals: Vec<Option<DkgPacket>> = sessions
            .iter_mut()
            .map(|s| s.start_dealing(&mut rng).unwrap())
            .collect();
        for (i, deal) in deals.into_iter().enumerate() {
            if let Some(deal) = deal {
                let deal = tamper(i, deal);
                deliver(sessions, i, &deal);
            }
        }

        let responses: Vec<Option<DkgPacket>> = sessions
            .iter_mut()
            .map(|s| s.start_responding(&mut rng).unwrap())
            .collect();
        for (i, response) in responses.into_iter().enumerate() {
            if let Some(response) = response {
                deliver(sessions, i, &response);
            }
        }

        let justifications: Vec<Option<DkgPacket>> = sessions
            .iter_mut()
            .map(|s| s.start_justifying().unwrap())
            .collect();
        for (i, justification) in justifications.into_iter().enumerate() {
            if let Some(justification) = justification {
                deliver(sessions, i, &justification);
            }
        }
    }

    fn fresh_sessions(keys: &[KeyPair], threshold: u32) -> Vec<DkgSession> {
        let proposal = make_proposal(keys, threshold);
        let session_id = SessionId::derive(&proposal.digest().unwrap(), 1_700_000_100);
        keys.iter()
            .map(|k| DkgSession::fresh(k.clone(), proposal.clone(), session_id).unwrap())
            .collect()
    }

    #[test]
    fn five_node_fresh_dkg_agrees_and_signs() {
        let keys: Vec<KeyPair> = (0..5).map(|_| KeyPair::generate(&mut OsRng)).collect();
        let mut sessions = fresh_sessions(&keys, 3);
        run_to_finalize(&mut sessions, |_, p| p);

        let outputs: Vec<DkgOutput> = sessions
            .into_iter()
            .map(|s| s.finalize().unwrap())
            .collect();

        let pk = outputs[0].group.public_key().to_vec();
        for out in &outputs {
            assert_eq!(out.group.public_key(), &pk[..]);
            assert_eq!(out.qual.len(), 5);
            out.share.as_ref().unwrap().validate().unwrap();
        }
        outputs[0].group.validate().unwrap();

        // the shares actually sign: 3 partials recover a verifying signature
        let msg = b"post-dkg round";
        let partials: Vec<(u32, Vec<u8>)> = outputs[..3]
            .iter()
            .map(|o| {
                let share = o.share.as_ref().unwrap();
                (share.index, tbls::sign_partial(&share.private, msg))
            })
            .collect();
        let sig = tbls::recover(3, &partials).unwrap();
        let group_pk = rusty_beacon_crypto::decode_g2(&pk).unwrap();
        tbls::verify(&group_pk, msg, &sig).unwrap();
    }

    #[test]
    fn tampered_dealer_is_excluded_by_the_honest_majority() {
        let keys: Vec<KeyPair> = (0..5).map(|_| KeyPair::generate(&mut OsRng)).collect();
        let mut sessions = fresh_sessions(&keys, 3);
        let session_id = sessions[0].session_id();

        let tamperer = keys[0].clone();
        run_to_finalize(&mut sessions, move |i, packet| {
            if i != 0 {
                return packet;
            }
            // dealer 0 garbles the ciphertext addressed to holder 2 and
            // re-signs, so the packet still authenticates
            let mut payload = packet.payload.clone();
            if let DkgPayload::Deal(deal) = &mut payload {
                for share in &mut deal.shares {
                    if share.recipient_index == 2 {
                        for b in &mut share.ciphertext {
                            *b ^= 0xff;
                        }
                    }
                }
            }
            sign_as(&tamperer, session_id, packet.sender_index, payload)
        });

        // honest nodes (victim included) exclude dealer 1 and agree
        let outputs: Vec<DkgOutput> = sessions
            .into_iter()
            .skip(1)
            .map(|s| s.finalize().unwrap())
            .collect();
        let pk = outputs[0].group.public_key().to_vec();
        for out in &outputs {
            assert_eq!(out.group.public_key(), &pk[..]);
            assert_eq!(out.qual, vec![2, 3, 4, 5]);
            out.share.as_ref().unwrap().validate().unwrap();
        }

        let msg = b"post-complaint round";
        let partials: Vec<(u32, Vec<u8>)> = outputs[..3]
            .iter()
            .map(|o| {
                let share = o.share.as_ref().unwrap();
                (share.index, tbls::sign_partial(&share.private, msg))
            })
            .collect();
        let sig = tbls::recover(3, &partials).unwrap();
        let group_pk = rusty_beacon_crypto::decode_g2(&pk).unwrap();
        tbls::verify(&group_pk, msg, &sig).unwrap();
    }

    #[test]
    fn bogus_complaint_is_rejected() {
        let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate(&mut OsRng)).collect();
        let mut sessions = fresh_sessions(&keys, 3);
        let session_id = sessions[0].session_id();
        let mut rng = OsRng;

        let deals: Vec<Option<DkgPacket>> = sessions
            .iter_mut()
            .map(|s| s.start_dealing(&mut rng).unwrap())
            .collect();
        for (i, deal) in deals.into_iter().enumerate() {
            deliver(&mut sessions, i, &deal.unwrap());
        }

        let responses: Vec<Option<DkgPacket>> = sessions
            .iter_mut()
            .map(|s| s.start_responding(&mut rng).unwrap())
            .collect();
        // node 2 (holder index 2) swaps in a fabricated complaint against
        // dealer 1 whose witness proves nothing
        for (i, response) in responses.into_iter().enumerate() {
            let packet = if i == 1 {
                let fake = Scalar::from(1234u64);
                let (_, witness, proof) = DleqProof::prove(
                    &G2Projective::generator(),
                    &(G2Projective::generator() * Scalar::from(5u64)),
                    &fake,
                    &mut rng,
                );
                let (c, z) = proof.to_bytes();
                sign_as(
                    &keys[1],
                    session_id,
                    2,
                    DkgPayload::Response(Response {
                        statuses: vec![(
                            1,
                            DealStatus::Complaint {
                                witness: rusty_beacon_crypto::encode_g2(&witness),
                                dleq_challenge: c,
                                dleq_response: z,
                            },
                        )],
                    }),
                )
            } else {
                response.unwrap()
            };
            deliver(&mut sessions, i, &packet);
        }

        // nobody records the complaint, so nobody needs to justify
        for s in sessions.iter_mut() {
            assert!(s.start_justifying().unwrap().is_none());
        }

        for (i, s) in sessions.into_iter().enumerate() {
            let out = s.finalize().unwrap();
            assert!(out.qual.contains(&1), "node {i} dropped dealer 1");
        }
    }

    #[test]
    fn too_few_dealers_fails_without_output() {
        let keys: Vec<KeyPair> = (0..5).map(|_| KeyPair::generate(&mut OsRng)).collect();
        let mut sessions = fresh_sessions(&keys, 3);
        let mut rng = OsRng;

        // only nodes 0 and 1 ever deal
        let deals: Vec<DkgPacket> = sessions[..2]
            .iter_mut()
            .map(|s| s.start_dealing(&mut rng).unwrap().unwrap())
            .collect();
        for (i, deal) in deals.into_iter().enumerate() {
            deliver(&mut sessions, i, &deal);
        }

        let responses: Vec<Option<DkgPacket>> = sessions
            .iter_mut()
            .map(|s| s.start_responding(&mut rng).unwrap())
            .collect();
        for (i, response) in responses.into_iter().enumerate() {
            if let Some(r) = response {
                deliver(&mut sessions, i, &r);
            }
        }

        for s in sessions {
            match s.finalize() {
                Err(DkgError::NotEnoughDealers { have: 2, need: 3 }) => {}
                other => panic!("expected NotEnoughDealers, got {:?}", other.err().map(|e| e.to_string())),
            }
        }
    }

    fn reshare_sessions(
        old_keys: &[KeyPair],
        old_group: &Group,
        old_public: &PublicPoly,
        old_shares: &[Share],
        new_keys: &[KeyPair],
        new_threshold: u32,
    ) -> Vec<DkgSession> {
        let proposal = GroupProposal {
            nodes: new_keys
                .iter()
                .enumerate()
                .map(|(i, k)| k.identity(format!("127.0.0.1:{}", 9000 + i), false))
                .collect(),
            threshold: new_threshold,
            period: old_group.period,
            genesis_time: old_group.genesis_time,
            scheme: old_group.scheme,
            transition_time: Some(old_group.genesis_time + 60),
        };
        let session_id = SessionId::derive(&proposal.digest().unwrap(), 1_700_000_200);

        new_keys
            .iter()
            .map(|k| {
                let pk = k.public_bytes();
                let old_share = old_keys
                    .iter()
                    .position(|ok| ok.public_bytes() == pk)
                    .map(|p| old_shares[p].clone());
                let old = OldGroup {
                    group: old_group.clone(),
                    public: old_public.clone(),
                    share: old_share,
                };
                DkgSession::reshare(k.clone(), old, proposal.clone(), session_id).unwrap()
            })
            .collect()
    }

    #[test]
    fn reshare_add_one_preserves_the_public_key() {
        // bootstrap a 5-of-3 group with a fresh DKG
        let keys: Vec<KeyPair> = (0..5).map(|_| KeyPair::generate(&mut OsRng)).collect();
        let mut sessions = fresh_sessions(&keys, 3);
        run_to_finalize(&mut sessions, |_, p| p);
        let outputs: Vec<DkgOutput> = sessions
            .into_iter()
            .map(|s| s.finalize().unwrap())
            .collect();
        let old_group = outputs[0].group.clone();
        let old_pk = old_group.public_key().to_vec();
        let old_shares: Vec<Share> = outputs.iter().map(|o| o.share.clone().unwrap()).collect();
        let old_public = old_shares[0].public.clone();

        // reshare to 6 nodes, threshold 4
        let mut new_keys = keys.clone();
        new_keys.push(KeyPair::generate(&mut OsRng));
        let mut sessions = reshare_sessions(&keys, &old_group, &old_public, &old_shares, &new_keys, 4);
        run_to_finalize(&mut sessions, |_, p| p);

        let outputs: Vec<DkgOutput> = sessions
            .into_iter()
            .map(|s| s.finalize().unwrap())
            .collect();

        for out in &outputs {
            // the group key survived the rotation
            assert_eq!(out.group.public_key(), &old_pk[..]);
            assert_eq!(out.group.threshold, 4);
            assert_eq!(out.group.len(), 6);
            out.share.as_ref().unwrap().validate().unwrap();
        }

        // the newcomer's share participates in signing under the old key
        let msg = b"post-reshare round";
        let signers = [&outputs[5], &outputs[0], &outputs[2], &outputs[4]];
        let partials: Vec<(u32, Vec<u8>)> = signers
            .iter()
            .map(|o| {
                let share = o.share.as_ref().unwrap();
                (share.index, tbls::sign_partial(&share.private, msg))
            })
            .collect();
        let sig = tbls::recover(4, &partials).unwrap();
        let group_pk = rusty_beacon_crypto::decode_g2(&old_pk).unwrap();
        tbls::verify(&group_pk, msg, &sig).unwrap();
    }

    #[test]
    fn reshare_dealer_with_wrong_constant_is_poisoned() {
        let keys: Vec<KeyPair> = (0..5).map(|_| KeyPair::generate(&mut OsRng)).collect();
        let mut sessions = fresh_sessions(&keys, 3);
        run_to_finalize(&mut sessions, |_, p| p);
        let outputs: Vec<DkgOutput> = sessions
            .into_iter()
            .map(|s| s.finalize().unwrap())
            .collect();
        let old_group = outputs[0].group.clone();
        let old_pk = old_group.public_key().to_vec();
        let old_shares: Vec<Share> = outputs.iter().map(|o| o.share.clone().unwrap()).collect();
        let old_public = old_shares[0].public.clone();

        let mut sessions =
            reshare_sessions(&keys, &old_group, &old_public, &old_shares, &keys, 3);
        let session_id = sessions[0].session_id();

        // dealer 0 deals a polynomial unrelated to its old share
        let rogue = keys[0].clone();
        let nodes: Vec<Identity> = old_group.nodes.clone();
        run_to_finalize(&mut sessions, move |i, packet| {
            if i != 0 {
                return packet;
            }
            let mut rng = OsRng;
            let poly = PrivatePoly::random(2, &mut rng);
            let mut shares = Vec::new();
            for (pos, holder) in nodes.iter().enumerate() {
                let idx = pos as u32 + 1;
                if idx == 1 {
                    continue;
                }
                let pk = rusty_beacon_crypto::decode_g2(&holder.public_key).unwrap();
                let (ephemeral, ciphertext) = ecies::encrypt(&pk, &poly.eval(idx), &mut rng);
                shares.push(EncryptedShare { recipient_index: idx, ephemeral, ciphertext });
            }
            sign_as(
                &rogue,
                session_id,
                1,
                DkgPayload::Deal(Deal { commits: poly.commit().to_bytes(), shares }),
            )
        });

        // honest nodes exclude the rogue dealer and still preserve the key
        for s in sessions.into_iter().skip(1) {
            let out = s.finalize().unwrap();
            assert!(!out.qual.contains(&1));
            assert_eq!(out.group.public_key(), &old_pk[..]);
        }
    }
}

