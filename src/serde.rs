use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::{AaTree, WalkOrder};

impl<K, T> Serialize for AaTree<K, T>
where
    K: 'static,
    T: 'static + Serialize,
{
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        let mut result = Ok(());
        self.walk(WalkOrder::InOrder, |entry| {
            if result.is_ok() {
                result = seq.serialize_element(entry);
            }
        });
        result?;
        seq.end()
    }
}
