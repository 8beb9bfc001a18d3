//! Typed collectives
//!
//! Payloads travel as MessagePack (`rmp-serde`), the same encoding the TCP
//! transport uses for its frames.

use crate::distributed::{CommError, Communicator};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value as a collective payload
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CommError> {
    rmp_serde::to_vec(value).map_err(|e| CommError::Codec(e.to_string()))
}

/// Decode a collective payload
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CommError> {
    rmp_serde::from_slice(bytes).map_err(|e| CommError::Codec(e.to_string()))
}

/// Broadcast a value from root
///
/// Root passes `Some(value)`; everyone else passes `None`. Returns the value on
/// every member.
pub fn broadcast<T, C>(comm: &C, root: usize, value: Option<&T>) -> Result<T, CommError>
where
    T: Serialize + DeserializeOwned,
    C: Communicator + ?Sized,
{
    let payload = if comm.rank() == root {
        let value = value.ok_or_else(|| {
            CommError::Codec(format!("broadcast root {} has no value to send", root))
        })?;
        Some(encode(value)?)
    } else {
        None
    };

    let bytes = comm.broadcast_bytes(root, payload)?;
    decode(&bytes)
}

/// Gather one value per member on root, in rank order
pub fn gather<T, C>(comm: &C, root: usize, value: &T) -> Result<Option<Vec<T>>, CommError>
where
    T: Serialize + DeserializeOwned,
    C: Communicator + ?Sized,
{
    match comm.gather_bytes(root, encode(value)?)? {
        Some(all) => all
            .iter()
            .map(|bytes| decode(bytes))
            .collect::<Result<Vec<T>, _>>()
            .map(Some),
        None => Ok(None),
    }
}

/// Gather one value per member on every member, in rank order
pub fn all_gather<T, C>(comm: &C, value: &T) -> Result<Vec<T>, CommError>
where
    T: Serialize + DeserializeOwned,
    C: Communicator + ?Sized,
{
    comm.all_gather_bytes(encode(value)?)?
        .iter()
        .map(|bytes| decode(bytes))
        .collect()
}

/// Reduce one value per member onto root
///
/// `combine` is applied in rank order on root only. Other members receive `None`.
pub fn reduce<T, C, F>(comm: &C, root: usize, value: T, combine: F) -> Result<Option<T>, CommError>
where
    T: Serialize + DeserializeOwned,
    C: Communicator + ?Sized,
    F: Fn(T, T) -> T,
{
    let Some(values) = gather(comm, root, &value)? else {
        return Ok(None);
    };
    Ok(values.into_iter().reduce(combine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCluster;

    #[test]
    fn test_encode_decode_tuple() {
        let bytes = encode(&(Some(3u32), 42u64)).unwrap();
        let decoded: (Option<u32>, u64) = decode(&bytes).unwrap();
        assert_eq!(decoded, (Some(3), 42));
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let err = decode::<Vec<f64>>(&[0xc1]).unwrap_err();
        assert!(matches!(err, CommError::Codec(_)));
    }

    #[test]
    fn test_typed_collectives_across_threads() {
        let cluster = LocalCluster::new(4, 1).unwrap();

        let results = cluster
            .run(|comm, _node_id| {
                let rank = comm.rank();

                let length: u64 = if rank == 0 {
                    broadcast(&comm, 0, Some(&1234u64))?
                } else {
                    broadcast(&comm, 0, None)?
                };

                let ranks = all_gather(&comm, &(rank as u32))?;
                let total = reduce(&comm, 0, rank as u64 * 10, |a, b| a + b)?;

                Ok((length, ranks, total))
            })
            .unwrap();

        for (rank, (length, ranks, total)) in results.into_iter().enumerate() {
            assert_eq!(length, 1234);
            assert_eq!(ranks, vec![0, 1, 2, 3]);
            if rank == 0 {
                assert_eq!(total, Some(60));
            } else {
                assert_eq!(total, None);
            }
        }
    }

    #[test]
    fn test_broadcast_root_without_value_fails() {
        let cluster = LocalCluster::new(1, 1).unwrap();
        let err = cluster
            .run(|comm, _| Ok(broadcast::<u64, _>(&comm, 0, None)?))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("no value"));
    }
}
