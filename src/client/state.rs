use std::fmt;

/// Tie-break role for a pair of peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Yields on glare and may send a backup offer.
    Polite,
    /// Offers first and keeps its own offer on glare.
    Impolite,
}

impl Role {
    /// The lexicographically larger identity is impolite.
    pub fn for_pair(local: &str, remote: &str) -> Role {
        if local > remote {
            Role::Impolite
        } else {
            Role::Polite
        }
    }
}

/// Negotiation progress of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Created, nothing exchanged yet.
    Idle,
    /// Local offer applied, waiting for the answer.
    OfferSent,
    /// Remote offer applied, answer not yet sent.
    AnswerPending,
    Stable,
    /// Transport is being rebuilt or restarted.
    Recovering,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationInput {
    LocalOffer,
    RemoteOffer,
    RemoteAnswer,
    LocalAnswer,
    Rollback,
    Recover,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal negotiation transition: {input:?} in {from:?}")]
pub struct IllegalTransition {
    pub from: NegotiationState,
    pub input: NegotiationInput,
}

impl NegotiationState {
    pub fn apply(self, input: NegotiationInput) -> Result<Self, IllegalTransition> {
        use NegotiationInput as I;
        use NegotiationState as S;

        let next = match (self, input) {
            (S::Closed, _) => None,
            (_, I::Close) => Some(S::Closed),
            (_, I::Recover) => Some(S::Recovering),
            (S::Idle | S::Stable | S::Recovering, I::LocalOffer) => Some(S::OfferSent),
            (S::Idle | S::Stable | S::Recovering, I::RemoteOffer) => Some(S::AnswerPending),
            (S::OfferSent, I::RemoteAnswer) => Some(S::Stable),
            (S::OfferSent | S::AnswerPending, I::Rollback) => Some(S::Stable),
            (S::AnswerPending, I::LocalAnswer) => Some(S::Stable),
            _ => None,
        };
        next.ok_or(IllegalTransition { from: self, input })
    }

    /// Whether a new local offer may be started from here.
    pub fn can_offer(self) -> bool {
        matches!(self, Self::Idle | Self::Stable | Self::Recovering)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "idle"),
            NegotiationState::OfferSent => write!(f, "offer-sent"),
            NegotiationState::AnswerPending => write!(f, "answer-pending"),
            NegotiationState::Stable => write!(f, "stable"),
            NegotiationState::Recovering => write!(f, "recovering"),
            NegotiationState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NegotiationInput as I;
    use NegotiationState as S;

    #[test]
    fn larger_identity_is_impolite() {
        assert_eq!(Role::for_pair("B", "A"), Role::Impolite);
        assert_eq!(Role::for_pair("A", "B"), Role::Polite);
        assert_eq!(Role::for_pair("bob", "Bob"), Role::Impolite);
    }

    #[test]
    fn offer_answer_cycle() {
        let s = S::Idle.apply(I::LocalOffer).unwrap();
        assert_eq!(s, S::OfferSent);
        assert_eq!(s.apply(I::RemoteAnswer), Ok(S::Stable));

        let s = S::Stable.apply(I::RemoteOffer).unwrap();
        assert_eq!(s.apply(I::LocalAnswer), Ok(S::Stable));
    }

    #[test]
    fn glare_rollback_then_answer() {
        let s = S::OfferSent.apply(I::Rollback).unwrap();
        let s = s.apply(I::RemoteOffer).unwrap();
        assert_eq!(s, S::AnswerPending);
    }

    #[test]
    fn illegal_moves_are_rejected() {
        assert!(S::OfferSent.apply(I::LocalOffer).is_err());
        assert!(S::Stable.apply(I::RemoteAnswer).is_err());
        assert!(S::Idle.apply(I::LocalAnswer).is_err());
        let err = S::Closed.apply(I::Recover).unwrap_err();
        assert_eq!(err.from, S::Closed);
        assert!(!S::AnswerPending.can_offer());
    }

    #[test]
    fn recovery_is_reachable_from_any_live_state() {
        for s in [S::Idle, S::OfferSent, S::AnswerPending, S::Stable] {
            assert_eq!(s.apply(I::Recover), Ok(S::Recovering));
        }
        assert_eq!(S::Recovering.apply(I::LocalOffer), Ok(S::OfferSent));
    }
}
