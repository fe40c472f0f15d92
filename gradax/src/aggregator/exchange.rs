//! Main-rank gather + reduce + broadcast of the header record.

use futures::future::select_all;

use crate::error::Result;
use crate::header::GradHeader;
use crate::messaging::Messaging;

/// Exchange headers across ranks; on return every rank's `header` holds the
/// element-wise sum of all ranks' inputs.
///
/// The main rank posts one receive per peer and folds arrivals in completion
/// order (headers are additive and commutative, so any-order is safe), then
/// broadcasts the total. Peers send their header and receive the broadcast.
/// `tag` is the call's gradient count, disambiguating header traffic.
pub(crate) async fn exchange_headers<M: Messaging>(
    mpi: &M,
    header: &mut GradHeader,
    recv_headers: &mut [GradHeader],
    tag: u64,
) -> Result<()> {
    let world = mpi.world_size();
    if world == 1 {
        return Ok(());
    }

    if mpi.is_main() {
        let my = mpi.rank();
        let sources: Vec<_> = (0..world as u32 - 1)
            .map(|j| if j >= my { j + 1 } else { j })
            .collect();
        let mut pending: Vec<_> = sources
            .iter()
            .map(|&src| Box::pin(mpi.recv(src, tag)))
            .collect();
        let mut received = 0usize;
        while !pending.is_empty() {
            let (result, _idx, rest) = select_all(pending).await;
            let bytes = result?;
            let slot = &mut recv_headers[received];
            slot.decode_into(&bytes)?;
            header.add_from(slot)?;
            received += 1;
            pending = rest;
        }

        let mut image = header.encode();
        mpi.broadcast(mpi.main_rank(), &mut image).await?;
    } else {
        let send = mpi.send(mpi.main_rank(), tag, header.encode());
        let mut image = vec![0u8; GradHeader::wire_size(header.num_eval())];
        let bcast = mpi.broadcast(mpi.main_rank(), &mut image);
        let (sent, broadcast) = tokio::join!(send, bcast);
        sent?;
        broadcast?;
        header.decode_into(&image)?;
    }

    Ok(())
}
