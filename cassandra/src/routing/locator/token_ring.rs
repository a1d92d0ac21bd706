use crate::routing::Token;

/// A token ring maps token ranges to their owners.
///
/// Each entry is a `(token, owner)` pair; a node owning several tokens appears
/// once per token. The owner of a token is the entry with the smallest token
/// greater than or equal to it, wrapping around to the lowest entry past the
/// largest one.
#[derive(Debug, Clone)]
pub struct TokenRing<ElemT> {
    ring: Vec<(Token, ElemT)>,
}

impl<ElemT> Default for TokenRing<ElemT> {
    fn default() -> Self {
        Self::new_empty()
    }
}

impl<ElemT> TokenRing<ElemT> {
    pub(crate) const fn new_empty() -> TokenRing<ElemT> {
        Self { ring: Vec::new() }
    }

    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, ElemT)>) -> TokenRing<ElemT> {
        let mut ring: Vec<(Token, ElemT)> = ring_iter.collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        TokenRing { ring }
    }

    /// Iterates over all members of the ring starting at the lowest token.
    pub fn iter(&self) -> impl Iterator<Item = &(Token, ElemT)> {
        self.ring.iter()
    }

    /// Walks the whole ring once, starting at the owner of `token` and going
    /// in the direction of increasing tokens, wrapping around after the largest one.
    pub fn ring_range_full<'a>(
        &'a self,
        token: &Token,
    ) -> impl Iterator<Item = &'a (Token, ElemT)> + Clone + 'a {
        let start = self.ring.partition_point(|(t, _)| t < token);

        self.ring[start..]
            .iter()
            .chain(self.ring[..start].iter())
    }

    /// Same as [`TokenRing::ring_range_full`], yielding only the owners.
    pub fn ring_range<'a>(&'a self, token: &Token) -> impl Iterator<Item = &'a ElemT> + Clone + 'a {
        self.ring_range_full(token).map(|(_t, e)| e)
    }

    /// Returns the owner of the given token.
    pub fn get_elem_for_token(&self, token: &Token) -> Option<&ElemT> {
        self.ring_range(token).next()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl<ElemT: PartialEq> TokenRing<ElemT> {
    /// Builds a new ring without the entries owned by `elem`.
    pub(crate) fn without(&self, elem: &ElemT) -> TokenRing<ElemT>
    where
        ElemT: Clone,
    {
        TokenRing {
            ring: self
                .ring
                .iter()
                .filter(|(_, e)| e != elem)
                .cloned()
                .collect(),
        }
    }
}
