use crate::error::CompileResult;
use crate::graph::{Graph, NodeId, OpAttrs, OpKind};
use crate::registry::{BackendKind, KindMask};
use crate::trace::CompileEvent;

use super::{GraphPass, PassContext, PassResult};

/// Records every node's preferred physical formats in a single forward sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatPropagation;

impl FormatPropagation {
    const NAME: &'static str = "format_propagation";
}

impl GraphPass for FormatPropagation {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut PassContext<'_>) -> CompileResult<PassResult> {
        let selector = cx.selector();
        let mut result = PassResult::default();
        let order = graph.processing_order().to_vec();

        for id in order {
            if !graph.node(id).op().is_data_flow() {
                continue;
            }
            graph.resolve_output_layout(id);
            if graph.node(id).is_eliminable() {
                continue;
            }

            let mask = KindMask::from_pin(graph.node(id).pinned_kind());
            let Some((descriptor, view)) = selector.candidate_after_stripping(graph, id, mask)
            else {
                log::trace!("no candidate for {} under {mask}", graph.describe(id));
                continue;
            };
            let kind = descriptor.kind();
            let preference = descriptor.query_formats(&view);
            graph.node_mut(id).set_selected_kind(Some(kind));

            if let Some(preference) = preference {
                log::trace!(
                    "{} prefers {:?} -> {:?} for {}",
                    descriptor.name(),
                    preference.inputs,
                    preference.outputs,
                    graph.describe(id)
                );
                graph.node_mut(id).apply_preference(&preference);
                graph.invalidate_layout(id);
                graph.resolve_output_layout(id);
                result.preferences_recorded += 1;
                result.changed = true;
            }

            if kind == BackendKind::Vendor
                && graph.node(id).op().is_compute()
                && fold_trailing_permute(graph, id)
            {
                result.changed = true;
            }
        }

        cx.emit(CompileEvent::PassFinished {
            pass: Self::NAME.to_string(),
            changed: result.changed,
        });
        Ok(result)
    }
}

/// Marks a trailing output-only permute of `id` as eliminable when it leaves
/// the batch and feature axes in place, pinning both nodes to one format.
fn fold_trailing_permute(graph: &mut Graph, id: NodeId) -> bool {
    let &[user] = graph.node(id).users() else {
        return false;
    };
    let permute = graph.node(user);
    if permute.op() != OpKind::Permute || !permute.users().is_empty() || permute.deps().len() != 1
    {
        return false;
    }
    let OpAttrs::Permute(attrs) = permute.attrs() else {
        return false;
    };
    if !attrs.keeps_leading_axes() {
        return false;
    }
    let format = graph.node(id).output_layout(0).format;
    if !format.is_resolved() || !format.accepts_rank(permute.output_layout(0).rank()) {
        return false;
    }

    graph.force_output_format(id, 0, format);
    graph.node_mut(user).set_preferred_input(0, format);
    graph.force_output_format(user, 0, format);
    graph.node_mut(user).set_eliminable(true);
    log::debug!(
        "permute {} folded into {} as {format}",
        graph.describe(user),
        graph.describe(id)
    );
    true
}
